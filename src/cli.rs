use bitcoin::Network as BitcoinNetwork;
use clap::{Parser, Subcommand};
use proxypay::AppError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 支払いリクエストを記述したJSONファイルへのパス
    #[clap(short, long, value_parser)]
    pub config: PathBuf,

    /// 使用するネットワーク ("bitcoin", "testnet", "regtest")。設定ファイルより優先
    #[clap(short, long, value_parser)]
    pub network: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 受け取りアドレスを表示する
    Address,
    /// 手数料・必要額・BIP21 URI を表示する
    Quote,
    /// 入金を待ち、揃ったらブロードキャストする
    Pay {
        /// フィードを購読せず、インデクサに一度だけ問い合わせる
        #[clap(long)]
        poll: bool,
    },
    /// アドレス上の全UTXOを指定先へ送る
    Sweep {
        /// 送金先アドレス (省略時は changeAddress)
        #[clap(long, value_parser)]
        to: Option<String>,
    },
    /// 請求書を作成し、埋め込み用の iframe を出力する
    Invoice {
        /// 既存の請求書IDを読み込む
        #[clap(long, value_parser)]
        load: Option<String>,
        /// iframe を埋め込む要素のセレクタ
        #[clap(long, value_parser, default_value = "#proxypay")]
        selector: String,
    },
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" | "livenet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}
