use bitcoin::{consensus::encode, Transaction, Txid};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use std::str::FromStr;

use crate::{
    error::AppError,
    types::{BroadcastResult, InputSpec, UnspentOutput},
};

pub const DEFAULT_INDEXER_URL: &str = "https://api.mattercloud.net/api/v3/main";

/// ブロックチェーンのインデックスサービス
pub trait IndexerClient {
    /// アドレス宛ての未使用出力を、承認数の多い順 (同数なら出力番号の小さい順) で返す
    fn get_utxo(&self, address: &str) -> Result<Vec<UnspentOutput>, AppError>;

    fn broadcast_tx(&self, tx: &Transaction) -> Result<BroadcastResult, AppError>;
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexedUtxo {
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    pub script_pub_key: String,
    #[serde(default)]
    pub confirmations: u64,
}

impl IndexedUtxo {
    pub fn into_unspent(self) -> Result<UnspentOutput, AppError> {
        InputSpec {
            tx_id: self.txid,
            output_index: self.vout,
            satoshis: self.satoshis,
            script: self.script_pub_key,
        }
        .normalize()
    }
}

pub fn sort_utxos(utxos: &mut [IndexedUtxo]) {
    utxos.sort_by(|a, b| {
        b.confirmations
            .cmp(&a.confirmations)
            .then(a.vout.cmp(&b.vout))
    });
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    message: EnvelopeMessage,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnvelopeMessage {
    Nested { message: String },
    Plain(String),
}

/// 複数行のメッセージは最終行を取り除いて一行にまとめる
pub fn strip_trailing_line(message: &str) -> String {
    let lines: Vec<&str> = message.split('\n').collect();
    if lines.len() > 1 {
        lines[..lines.len() - 1].join(" ")
    } else {
        message.to_string()
    }
}

/// サービスのエラー応答から人が読めるメッセージを取り出す
pub fn service_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { message: EnvelopeMessage::Nested { message } })
        | Ok(ErrorEnvelope { message: EnvelopeMessage::Plain(message) }) => strip_trailing_line(&message),
        Err(_) => body.trim().to_string(),
    }
}

/// 2xx 以外はサービスエラー、本文の解析失敗もサービスエラーとして扱う
pub(crate) fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AppError::Service {
            status: status.as_u16(),
            message: service_error_message(&body),
        });
    }
    response.json::<T>().map_err(|e| classify_body_error(status.as_u16(), e))
}

/// 本文の解析失敗はサービスエラー、本文の受信失敗は通信エラーとして扱う
fn classify_body_error(status: u16, e: reqwest::Error) -> AppError {
    if e.is_decode() {
        AppError::Service {
            status,
            message: format!("応答の解析に失敗しました: {}", e),
        }
    } else {
        AppError::Network(e)
    }
}

/// 応答本文から TXID を探し、無ければローカルで計算した値を使う
fn broadcast_txid(response: &serde_json::Value, tx: &Transaction) -> Txid {
    ["/txid", "/result/txid", "/data/txid"]
        .iter()
        .filter_map(|pointer| response.pointer(pointer).and_then(|v| v.as_str()))
        .find_map(|s| Txid::from_str(s).ok())
        .unwrap_or_else(|| tx.compute_txid())
}

/// MatterCloud (旧 BitIndex) 互換の REST クライアント
pub struct MatterCloudClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl MatterCloudClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder().build()?;
        Ok(MatterCloudClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.header("api_key", key),
            None => builder,
        }
    }
}

impl IndexerClient for MatterCloudClient {
    fn get_utxo(&self, address: &str) -> Result<Vec<UnspentOutput>, AppError> {
        let url = format!("{}/addr/{}/utxo", self.base_url, address);
        log::debug!("UTXO取得: {}", url);

        let response = self.request(self.client.get(&url)).send()?;
        let mut utxos: Vec<IndexedUtxo> = decode_response(response)?;
        sort_utxos(&mut utxos);
        log::info!("{} 件のUTXOを取得しました。アドレス: {}", utxos.len(), address);

        utxos.into_iter().map(IndexedUtxo::into_unspent).collect()
    }

    fn broadcast_tx(&self, tx: &Transaction) -> Result<BroadcastResult, AppError> {
        let url = format!("{}/tx/send", self.base_url);
        let rawtx = encode::serialize_hex(tx);
        log::debug!("ブロードキャスト: {} ({} bytes)", url, rawtx.len() / 2);

        let body = serde_json::json!({ "rawtx": rawtx });
        let response = self.request(self.client.post(&url)).json(&body).send()?;
        let response: serde_json::Value = decode_response(response)?;
        let txid = broadcast_txid(&response, tx);
        log::info!("トランザクションをブロードキャストしました: {}", txid);

        Ok(BroadcastResult { txid, response })
    }
}
