use bitcoin::network::Network as BitcoinNetwork;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::{
    embed::DEFAULT_FRAME_ORIGIN,
    error::AppError,
    feed::DEFAULT_FEED_URL,
    indexer::DEFAULT_INDEXER_URL,
    invoice::DEFAULT_INVOICE_URL,
    payment::PaymentOptions,
    transaction::DEFAULT_FEE_PER_KB,
    types::{InputSpec, OutputSpec},
};

/// 支払いリクエストを記述したJSONファイル
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfig {
    #[serde(default)]
    pub network: Option<String>, // "bitcoin", "testnet", "regtest"
    pub key: String,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub change_address: Option<String>,
    #[serde(default = "default_fee_per_kb")]
    pub fee_per_kb: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointConfig {
    pub indexer_url: String,
    pub api_key: Option<String>,
    pub feed_url: String,
    pub invoice_url: String,
    pub frame_origin: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            indexer_url: DEFAULT_INDEXER_URL.to_string(),
            api_key: None,
            feed_url: DEFAULT_FEED_URL.to_string(),
            invoice_url: DEFAULT_INVOICE_URL.to_string(),
            frame_origin: DEFAULT_FRAME_ORIGIN.to_string(),
        }
    }
}

fn default_fee_per_kb() -> u64 {
    DEFAULT_FEE_PER_KB
}

impl PaymentConfig {
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("設定ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        Self::from_json(&content).map_err(|source| {
            log::error!("設定JSONのパースに失敗しました。");
            AppError::JsonParse {
                file_path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// 構築オプションに変換する。自動の購読・ブロードキャストは呼び出し側で決める
    pub fn to_options(&self, network: BitcoinNetwork) -> PaymentOptions {
        let mut options = PaymentOptions::new(self.key.as_str());
        options.network = network;
        options.outputs = self.outputs.iter().cloned().map(Into::into).collect();
        options.inputs = self.inputs.iter().cloned().map(Into::into).collect();
        options.change_address = self.change_address.clone();
        options.fee_per_kb = self.fee_per_kb;
        options.description = self.description.clone();
        options.debug = self.debug;
        options
    }
}
