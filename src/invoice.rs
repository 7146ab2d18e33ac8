use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    indexer::decode_response,
    types::{Invoice, InvoiceRequest},
};

pub const DEFAULT_INVOICE_URL: &str = "http://localhost:4000/api";

pub trait InvoiceClient {
    fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, AppError>;

    fn load_invoice(&self, id: &str) -> Result<Invoice, AppError>;
}

#[derive(Serialize)]
struct CreateInvoiceBody<'a> {
    invoice: &'a InvoiceRequest,
}

#[derive(Deserialize)]
struct InvoiceEnvelope {
    data: Invoice,
}

pub struct HttpInvoiceClient {
    base_url: String,
    client: Client,
}

impl HttpInvoiceClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let client = Client::builder().build()?;
        Ok(HttpInvoiceClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl InvoiceClient for HttpInvoiceClient {
    fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, AppError> {
        let url = format!("{}/invoices", self.base_url);
        log::debug!("請求書を作成します: {} ({} sats)", url, request.satoshis);

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&CreateInvoiceBody { invoice: request })
            .send()?;
        let envelope: InvoiceEnvelope = decode_response(response)?;
        Ok(envelope.data)
    }

    fn load_invoice(&self, id: &str) -> Result<Invoice, AppError> {
        let url = format!("{}/invoices/{}", self.base_url, id);
        log::debug!("請求書を読み込みます: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()?;
        let envelope: InvoiceEnvelope = decode_response(response)?;
        Ok(envelope.data)
    }
}
