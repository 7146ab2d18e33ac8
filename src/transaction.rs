use bitcoin::{
    absolute::LockTime, hashes::Hash, network::Network as BitcoinNetwork, opcodes::{all::OP_RETURN, Opcode},
    script::{Builder, PushBytesBuf}, secp256k1::{All, Message, Secp256k1}, transaction::Version, Amount,
    PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::{
    error::AppError,
    keys::{parse_address, KeyPair},
    sighash::{forkid_signature_hash, SIGHASH_ALL_FORKID},
    types::{DataItem, OutputSpec, OutputTarget, UnspentOutput},
};

// これ未満の出力・請求額はダストとして扱う
pub const DUST_LIMIT_SATS: u64 = 547;

// 手数料率 (sats/kB)
pub const DEFAULT_FEE_PER_KB: u64 = 1000;

// トランザクションサイズの推定に使用するダミーデータ
const DUMMY_SIGNATURE_LEN: usize = 72;
const DUMMY_PUBKEY_LEN: usize = 33;
const CHANGE_OUTPUT_MAX_SIZE: usize = 34;
const DUMMY_INPUT_SATS: u64 = 100_000_000;

// 署名に必要な情報を一時的に保持するための構造体
struct SigningInfo {
    input_index: usize,
    sighash_message: Message,
}

/// 組み立て中のトランザクション。おつり出力は手数料を適用するたびに再計算される。
#[derive(Debug, Clone)]
pub struct TransactionInProgress {
    inputs: Vec<UnspentOutput>,
    outputs: Vec<TxOut>,
    change_script: ScriptBuf,
    change_sats: Option<u64>,
    fee: u64,
    fee_per_kb: u64,
}

impl TransactionInProgress {
    pub fn new(change_script: ScriptBuf, fee_per_kb: u64) -> Self {
        TransactionInProgress {
            inputs: Vec::new(),
            outputs: Vec::new(),
            change_script,
            change_sats: None,
            fee: 0,
            fee_per_kb,
        }
    }

    pub fn inputs(&self) -> &[UnspentOutput] {
        &self.inputs
    }

    /// おつり出力を含む全出力
    pub fn outputs(&self) -> Vec<TxOut> {
        let mut outputs = self.outputs.clone();
        if let Some(change) = self.change_tx_out() {
            outputs.push(change);
        }
        outputs
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn change_satoshis(&self) -> Option<u64> {
        self.change_sats
    }

    /// 入力が一つも無い場合は None
    pub fn input_amount(&self) -> Option<u64> {
        if self.inputs.is_empty() {
            None
        } else {
            Some(total_input_sats(&self.inputs))
        }
    }

    /// おつり出力を含む出力の合計
    pub fn output_amount(&self) -> u64 {
        self.payment_amount().saturating_add(self.change_sats.unwrap_or(0))
    }

    pub fn total_satoshis(&self) -> u64 {
        self.fee.saturating_add(self.output_amount()).max(DUST_LIMIT_SATS)
    }

    pub fn required_satoshis(&self) -> u64 {
        let funded = self.input_amount().unwrap_or(0);
        match self.total_satoshis().checked_sub(funded) {
            Some(0) | None => 0,
            Some(remaining) => remaining.max(DUST_LIMIT_SATS),
        }
    }

    pub fn is_funded(&self) -> bool {
        self.required_satoshis() == 0
    }

    pub fn contains(&self, utxo: &UnspentOutput) -> bool {
        self.inputs.iter().any(|i| i.out_point() == utxo.out_point())
    }

    /// 入力を追加する (手数料の再計算は呼び出し側が行う)
    pub fn push_input(&mut self, utxo: UnspentOutput) {
        log::debug!("入力追加: txid={}, vout={}, value={}", utxo.txid, utxo.output_index, utxo.satoshis);
        self.inputs.push(utxo);
    }

    pub fn push_output(&mut self, tx_out: TxOut) {
        log::debug!("出力追加: value={}, script={}", tx_out.value.to_sat(), tx_out.script_pubkey.to_hex_string());
        self.outputs.push(tx_out);
    }

    /// 手数料を見積もり、トランザクションに適用する
    pub fn estimate_fee(&mut self) -> u64 {
        let (fee, with_change) = if self.inputs.is_empty() {
            // 入力が無いとサイズを正しく見積もれないため、ダミー入力で計算する
            self.fee_for_inputs(&[dummy_input()])
        } else {
            self.fee_for_inputs(&self.inputs)
        };
        self.apply_fee(fee, with_change);
        fee
    }

    /// 手数料と、おつり出力を含めて見積もったかどうかを返す
    fn fee_for_inputs(&self, inputs: &[UnspentOutput]) -> (u64, bool) {
        let sizing_tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs.iter().map(placeholder_tx_in).collect(),
            output: self.outputs.clone(),
        };
        let mut size = sizing_tx.vsize();
        let mut fee = fee_for_size(size, self.fee_per_kb);

        // おつりがダスト閾値以上残る場合だけ、おつり出力の分もサイズに含める
        let available = total_input_sats(inputs).saturating_sub(self.payment_amount());
        let fee_with_change = fee_for_size(size + CHANGE_OUTPUT_MAX_SIZE, self.fee_per_kb);
        let with_change = available.saturating_sub(fee_with_change) >= DUST_LIMIT_SATS;
        if with_change {
            size += CHANGE_OUTPUT_MAX_SIZE;
            fee = fee_with_change;
        }
        log::debug!("推定サイズ: {} bytes, 手数料率: {} sats/kB, 計算された手数料: {} sats", size, self.fee_per_kb, fee);
        (fee, with_change)
    }

    fn apply_fee(&mut self, fee: u64, with_change: bool) {
        self.fee = fee;
        let spent = self.payment_amount().saturating_add(fee);
        self.change_sats = match total_input_sats(&self.inputs).checked_sub(spent) {
            Some(change) if with_change && change >= DUST_LIMIT_SATS => Some(change),
            Some(change) if change > 0 => {
                log::debug!("おつり {} sats は出力にせず手数料に含めます。", change);
                None
            }
            _ => None,
        };
    }

    fn payment_amount(&self) -> u64 {
        self.outputs.iter().fold(0u64, |sum, o| sum.saturating_add(o.value.to_sat()))
    }

    fn change_tx_out(&self) -> Option<TxOut> {
        self.change_sats.map(|sats| TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: self.change_script.clone(),
        })
    }

    pub fn to_unsigned(&self) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: self.inputs.iter().map(|utxo| TxIn {
                previous_output: utxo.out_point(),
                script_sig: ScriptBuf::new(), // 署名前は空
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }).collect(),
            output: self.outputs(),
        }
    }

    pub fn sign(&self, keys: &KeyPair, secp: &Secp256k1<All>) -> Result<Transaction, AppError> {
        let mut transaction = self.to_unsigned();
        sign_inputs(&mut transaction, &self.inputs, keys, secp)?;
        Ok(transaction)
    }
}

/// 全入力を P2PKH + SIGHASH_ALL|FORKID で署名する
pub fn sign_inputs(
    transaction: &mut Transaction,
    prevouts: &[UnspentOutput],
    keys: &KeyPair,
    secp: &Secp256k1<All>,
) -> Result<(), AppError> {
    log::info!("トランザクション署名処理を開始します。");
    let own_script = keys.locking_script();

    // 1. 署名ハッシュ計算フェーズ
    let mut signing_infos: Vec<SigningInfo> = Vec::with_capacity(prevouts.len());
    for (input_index, utxo) in prevouts.iter().enumerate() {
        if utxo.script != own_script {
            return Err(AppError::UnsignableInput {
                input_index,
                reason: format!("この鍵のP2PKHスクリプトではありません: {}", utxo.script.to_hex_string()),
            });
        }
        let sighash = forkid_signature_hash(
            transaction,
            input_index,
            &utxo.script,
            Amount::from_sat(utxo.satoshis),
            SIGHASH_ALL_FORKID,
        )?;
        signing_infos.push(SigningInfo {
            input_index,
            sighash_message: Message::from_digest(sighash.to_byte_array()),
        });
    }

    // 2. 署名生成と適用フェーズ
    for info in signing_infos {
        let signature = secp.sign_ecdsa(&info.sighash_message, &keys.private_key().inner);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(SIGHASH_ALL_FORKID as u8);

        let push = PushBytesBuf::try_from(sig_bytes)
            .map_err(|_| AppError::Internal(format!("署名のPushBytes変換失敗 (input {})", info.input_index)))?;
        transaction.input[info.input_index].script_sig = Builder::new()
            .push_slice(push)
            .push_key(keys.public_key())
            .into_script();
        log::debug!("入力 {} の署名適用完了。", info.input_index);
    }
    log::info!("全ての入力の署名が完了しました。");
    Ok(())
}

/// 全UTXOを消費し、指定先への単一出力にまとめた署名済みトランザクションを作る
pub fn build_sweep(
    utxos: Vec<UnspentOutput>,
    destination: ScriptBuf,
    fee_per_kb: u64,
    keys: &KeyPair,
    secp: &Secp256k1<All>,
) -> Result<Transaction, AppError> {
    let mut tx = TransactionInProgress::new(destination, fee_per_kb);
    for utxo in utxos {
        tx.push_input(utxo);
    }
    let available = tx.input_amount().unwrap_or(0);
    let fee = tx.estimate_fee();
    if tx.change_satoshis().is_none() {
        return Err(AppError::InsufficientFunds {
            available,
            required: fee.saturating_add(DUST_LIMIT_SATS),
            fee,
        });
    }
    tx.sign(keys, secp)
}

/// 出力記述をトランザクション出力に変換する
pub fn build_output(spec: &OutputSpec, network: BitcoinNetwork) -> Result<TxOut, AppError> {
    let script_pubkey = match &spec.target {
        OutputTarget::Address(address) => parse_address(address, network)?.script_pubkey(),
        OutputTarget::Script(script) => script.clone(),
        OutputTarget::Data(items) => build_data_script(items)?,
    };
    let mut satoshis = spec.satoshis;
    if !script_pubkey.is_op_return() && satoshis < DUST_LIMIT_SATS {
        log::warn!("出力 {} sats はダスト閾値未満のため {} sats に引き上げます。", satoshis, DUST_LIMIT_SATS);
        satoshis = DUST_LIMIT_SATS;
    }
    Ok(TxOut {
        value: Amount::from_sat(satoshis),
        script_pubkey,
    })
}

/// OP_RETURN に続けて各要素を順番通りに追加する
pub fn build_data_script(items: &[DataItem]) -> Result<ScriptBuf, AppError> {
    let mut builder = Builder::new().push_opcode(OP_RETURN);
    for item in items {
        builder = match item {
            DataItem::Text(text) => match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex_str) => {
                    let bytes = hex::decode(hex_str)
                        .map_err(|e| AppError::InputValidation(format!("16進数データのデコード失敗 ({}): {}", text, e)))?;
                    builder.push_slice(to_push_bytes(bytes)?)
                }
                None => builder.push_slice(to_push_bytes(text.as_bytes().to_vec())?),
            },
            DataItem::Bytes(bytes) => builder.push_slice(to_push_bytes(bytes.clone())?),
            DataItem::Opcode(op) => builder.push_opcode(Opcode::from(*op)),
        };
    }
    Ok(builder.into_script())
}

fn to_push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf, AppError> {
    let len = bytes.len();
    PushBytesBuf::try_from(bytes)
        .map_err(|_| AppError::InputValidation(format!("データが大きすぎます ({} bytes)", len)))
}

fn dummy_input() -> UnspentOutput {
    UnspentOutput {
        txid: Txid::all_zeros(),
        output_index: 0,
        satoshis: DUMMY_INPUT_SATS,
        script: ScriptBuf::new_p2pkh(&PubkeyHash::all_zeros()),
    }
}

// 手数料計算時はダミー署名と公開鍵のサイズを script_sig に反映する
fn placeholder_tx_in(utxo: &UnspentOutput) -> TxIn {
    TxIn {
        previous_output: utxo.out_point(),
        script_sig: Builder::new()
            .push_slice([0u8; DUMMY_SIGNATURE_LEN])
            .push_slice([0u8; DUMMY_PUBKEY_LEN])
            .into_script(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

fn fee_for_size(size: usize, fee_per_kb: u64) -> u64 {
    (size as u64 * fee_per_kb).div_ceil(1000)
}

fn total_input_sats(inputs: &[UnspentOutput]) -> u64 {
    // フィード由来の金額は信用できないため飽和加算にする
    inputs.iter().fold(0u64, |sum, i| sum.saturating_add(i.satoshis))
}
