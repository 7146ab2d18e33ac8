use bitcoin::{OutPoint, ScriptBuf, TxOut, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use crate::error::AppError;

/// 取引に取り込む前の未使用出力 (UTXO)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub output_index: u32,
    pub satoshis: u64,
    pub script: ScriptBuf,
}

impl UnspentOutput {
    pub fn out_point(&self) -> OutPoint {
        OutPoint::new(self.txid, self.output_index)
    }
}

/// 呼び出し側が渡す生の入力記述
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    #[serde(alias = "txid")]
    pub tx_id: String,
    #[serde(alias = "vout")]
    pub output_index: u32,
    #[serde(alias = "value")]
    pub satoshis: u64,
    #[serde(alias = "scriptPubKey")]
    pub script: String,
}

impl InputSpec {
    pub fn normalize(&self) -> Result<UnspentOutput, AppError> {
        let txid = Txid::from_str(&self.tx_id)
            .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", self.tx_id, e)))?;
        let script = ScriptBuf::from_hex(&self.script)
            .map_err(|e| AppError::InputValidation(format!("scriptのデコード失敗 ({}): {}", self.script, e)))?;
        Ok(UnspentOutput {
            txid,
            output_index: self.output_index,
            satoshis: self.satoshis,
            script,
        })
    }
}

/// 入力は呼び出し境界で「生の記述」か「正規化済み」かを区別する
#[derive(Debug, Clone)]
pub enum InputSource {
    Raw(InputSpec),
    Normalized(UnspentOutput),
}

impl InputSource {
    pub fn into_unspent(self) -> Result<UnspentOutput, AppError> {
        match self {
            InputSource::Raw(spec) => spec.normalize(),
            InputSource::Normalized(utxo) => Ok(utxo),
        }
    }
}

impl From<InputSpec> for InputSource {
    fn from(spec: InputSpec) -> Self {
        InputSource::Raw(spec)
    }
}

impl From<UnspentOutput> for InputSource {
    fn from(utxo: UnspentOutput) -> Self {
        InputSource::Normalized(utxo)
    }
}

/// OP_RETURN データ出力の要素
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "RawDataItem")]
pub enum DataItem {
    /// `0x` で始まる場合は16進数として、それ以外はUTF-8として push する
    Text(String),
    Bytes(Vec<u8>),
    /// opcode をそのまま追加する
    Opcode(u8),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataItem {
    Null,
    Number(u8),
    Op { op: u8 },
    Text(String),
}

impl From<RawDataItem> for DataItem {
    fn from(raw: RawDataItem) -> Self {
        match raw {
            RawDataItem::Null => DataItem::Opcode(0),
            RawDataItem::Number(n) => DataItem::Opcode(n),
            RawDataItem::Op { op } => DataItem::Opcode(op),
            RawDataItem::Text(s) => DataItem::Text(s),
        }
    }
}

impl From<&str> for DataItem {
    fn from(s: &str) -> Self {
        DataItem::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Address(String),
    Script(ScriptBuf),
    Data(Vec<DataItem>),
}

/// 呼び出し側が宣言する支払い出力
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "RawOutputSpec")]
pub struct OutputSpec {
    pub target: OutputTarget,
    pub satoshis: u64,
}

impl OutputSpec {
    pub fn to(address: &str, satoshis: u64) -> Self {
        OutputSpec { target: OutputTarget::Address(address.to_string()), satoshis }
    }

    pub fn script(script: ScriptBuf, satoshis: u64) -> Self {
        OutputSpec { target: OutputTarget::Script(script), satoshis }
    }

    pub fn data<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DataItem>,
    {
        OutputSpec {
            target: OutputTarget::Data(items.into_iter().map(Into::into).collect()),
            satoshis: 0,
        }
    }
}

#[derive(Deserialize)]
struct RawOutputSpec {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    data: Option<Vec<DataItem>>,
    #[serde(default)]
    satoshis: u64,
}

impl TryFrom<RawOutputSpec> for OutputSpec {
    type Error = String;

    fn try_from(raw: RawOutputSpec) -> Result<Self, Self::Error> {
        // 優先順位: script > data > to
        let target = if let Some(hex) = raw.script {
            let script = ScriptBuf::from_hex(&hex)
                .map_err(|e| format!("scriptのデコード失敗 ({}): {}", hex, e))?;
            OutputTarget::Script(script)
        } else if let Some(items) = raw.data {
            OutputTarget::Data(items)
        } else if let Some(address) = raw.to {
            OutputTarget::Address(address)
        } else {
            return Err("出力には to / script / data のいずれかが必要です".to_string());
        };
        Ok(OutputSpec { target, satoshis: raw.satoshis })
    }
}

#[derive(Debug, Clone)]
pub enum OutputSource {
    Spec(OutputSpec),
    Normalized(TxOut),
}

impl From<OutputSpec> for OutputSource {
    fn from(spec: OutputSpec) -> Self {
        OutputSource::Spec(spec)
    }
}

impl From<TxOut> for OutputSource {
    fn from(tx_out: TxOut) -> Self {
        OutputSource::Normalized(tx_out)
    }
}

/// ブロードキャスト成功時の応答
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastResult {
    pub txid: Txid,
    pub response: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    #[serde(default)]
    pub id: Option<String>,
    pub satoshis: u64,
    pub script: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub satoshis: u64,
    pub script: String,
    pub description: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PaymentState {
    Unfunded,
    Funded,
    Broadcasting,
    Settled,
    Errored,
}

impl PaymentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentState::Settled | PaymentState::Errored)
    }
}

/// 呼び出し側へ順番通りに届けられるイベント
#[derive(Debug)]
pub enum PaymentEvent {
    Created,
    Funded,
    Payment(BroadcastResult),
    Invoice(Invoice),
    Error(AppError),
}
