use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::{ScriptBuf, Txid};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::str::FromStr;

use crate::{error::AppError, types::UnspentOutput};

pub const DEFAULT_FEED_URL: &str = "https://txo.bitsocket.network/s/";

/// プッシュ通知の購読。明示的に close するまで開いたまま
pub trait Subscription {
    fn url(&self) -> &str;

    /// 次のメッセージを待つ。ストリームが終了した場合は None
    fn next_message(&mut self) -> Option<Result<FeedMessage, AppError>>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

pub trait LiveFeed {
    fn listen(&self, address: &str, amount: Option<u64>) -> Result<Box<dyn Subscription>, AppError>;
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    v: u8,
    q: FeedFind,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
struct FeedFind {
    find: FeedFilter,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
struct FeedFilter {
    #[serde(rename = "out.e.a")]
    address: String,
    #[serde(rename = "out.e.v", skip_serializing_if = "Option::is_none")]
    amount: Option<u64>,
}

impl FeedQuery {
    pub fn new(address: &str, amount: Option<u64>) -> Self {
        FeedQuery {
            v: 3,
            q: FeedFind {
                find: FeedFilter { address: address.to_string(), amount },
            },
        }
    }

    /// 購読URLに付与する base64 文字列
    pub fn encode(&self) -> Result<String, AppError> {
        let json = serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("クエリのシリアライズに失敗: {}", e)))?;
        Ok(STANDARD.encode(json))
    }

    pub fn url(&self, base_url: &str) -> Result<String, AppError> {
        Ok(format!("{}{}", base_url, self.encode()?))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FeedMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Vec<FeedTx>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedTx {
    pub tx: FeedTxId,
    #[serde(default)]
    pub out: Vec<FeedOutput>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedTxId {
    pub h: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedOutput {
    pub i: u32,
    pub e: FeedOutputValue,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedOutputValue {
    #[serde(default)]
    pub a: Option<String>,
    #[serde(default)]
    pub v: u64,
}

impl FeedTx {
    /// 指定アドレスと完全に一致する出力だけを UTXO に変換する
    pub fn outputs_paying(&self, address: &str, script: &ScriptBuf) -> Vec<UnspentOutput> {
        let txid = match Txid::from_str(&self.tx.h) {
            Ok(txid) => txid,
            Err(e) => {
                log::warn!("フィードのTXIDを解析できません ({}): {}", self.tx.h, e);
                return Vec::new();
            }
        };
        self.out
            .iter()
            .filter(|o| o.e.a.as_deref() == Some(address))
            .map(|o| UnspentOutput {
                txid,
                output_index: o.i,
                satoshis: o.e.v,
                script: script.clone(),
            })
            .collect()
    }
}

/// text/event-stream の行を受け取り、完成したイベントの data を返す
#[derive(Debug, Default)]
pub struct EventStreamParser {
    data: Vec<String>,
}

impl EventStreamParser {
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let data = self.data.join("\n");
            self.data.clear();
            return Some(data);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

/// BitSocket の Server-Sent Events フィード
pub struct BitSocketFeed {
    base_url: String,
    client: Client,
}

impl BitSocketFeed {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        // 購読は長時間開いたままなのでタイムアウトは設定しない
        let client = Client::builder().timeout(None).build()?;
        Ok(BitSocketFeed { base_url: base_url.to_string(), client })
    }
}

impl LiveFeed for BitSocketFeed {
    fn listen(&self, address: &str, amount: Option<u64>) -> Result<Box<dyn Subscription>, AppError> {
        let url = FeedQuery::new(address, amount).url(&self.base_url)?;
        log::debug!("フィード購読を開始します: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Service {
                status: status.as_u16(),
                message: format!("フィードの購読に失敗しました: {}", url),
            });
        }

        Ok(Box::new(BitSocketSubscription {
            url,
            reader: Some(BufReader::new(response)),
            parser: EventStreamParser::default(),
        }))
    }
}

pub struct BitSocketSubscription {
    url: String,
    reader: Option<BufReader<Response>>,
    parser: EventStreamParser,
}

impl Subscription for BitSocketSubscription {
    fn url(&self) -> &str {
        &self.url
    }

    fn next_message(&mut self) -> Option<Result<FeedMessage, AppError>> {
        let reader = self.reader.as_mut()?;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    log::info!("フィードが終了しました: {}", self.url);
                    self.reader = None;
                    return None;
                }
                Ok(_) => {
                    if let Some(data) = self.parser.push_line(&line) {
                        return Some(serde_json::from_str(&data).map_err(|e| {
                            AppError::InputValidation(format!("フィードメッセージの解析に失敗: {}", e))
                        }));
                    }
                }
                Err(e) => {
                    log::warn!("フィードの読み込みに失敗しました: {}", self.url);
                    self.reader = None;
                    return Some(Err(AppError::FeedDisconnected { url: self.url.clone(), source: e }));
                }
            }
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}
