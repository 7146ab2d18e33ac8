use std::path::PathBuf;
use bitcoin::address::ParseError as BitcoinAddressError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("設定エラー: {0}")]
    Configuration(String),

    #[error("Bitcoinアドレスエラー: {0}")]
    BitcoinAddress(#[from] BitcoinAddressError),

    #[error("署名できない入力 (入力インデックス {input_index}): {reason}")]
    UnsignableInput { input_index: usize, reason: String },

    #[error("ネットワーク不整合: 指定 ({configured}) vs WIF ({inferred})")]
    NetworkMismatch {
        configured: String,
        inferred: String,
    },

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("資金不足: 利用可能な総額 {available} sats, 要求額 {required} sats (手数料 {fee} sats を含む)")]
    InsufficientFunds {
        available: u64,
        required: u64,
        fee: u64,
    },

    /// 応答が得られなかった通信エラー
    #[error("通信エラー: {0}")]
    Network(#[from] reqwest::Error),

    /// サービスには到達したが要求が拒否された
    #[error("サービスエラー (ステータス {status}): {message}")]
    Service { status: u16, message: String },

    /// 購読中のストリームが切断された
    #[error("フィードの接続が切断されました ({url}): {source}")]
    FeedDisconnected {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("内部エラー: {0}")]
    Internal(String),
}

impl AppError {
    /// 応答自体が得られなかった、または途中で切断された場合 true
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::FeedDisconnected { .. })
    }

    /// サービスが要求を拒否した場合 true (手数料不足や二重支払いなど)
    pub fn is_service(&self) -> bool {
        matches!(self, AppError::Service { .. })
    }
}
