use bitcoin::{
    consensus::encode::serialize,
    hashes::{sha256d, Hash},
    Amount, Script, Transaction,
};

use crate::error::AppError;

/// SIGHASH_ALL | SIGHASH_FORKID
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

/// BSV の FORKID 署名ハッシュ (BIP143 と同じ配置) を計算する。
/// `bitcoin` クレートの EcdsaSighashType は FORKID を表現できないため、ここで組み立てる。
pub fn forkid_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    sighash_type: u32,
) -> Result<sha256d::Hash, AppError> {
    let input = tx.input.get(input_index).ok_or_else(|| {
        AppError::Internal(format!("入力インデックス {} が範囲外です (入力数 {})", input_index, tx.input.len()))
    })?;

    let mut prevouts = Vec::with_capacity(tx.input.len() * 36);
    let mut sequences = Vec::with_capacity(tx.input.len() * 4);
    for txin in &tx.input {
        prevouts.extend_from_slice(&serialize(&txin.previous_output));
        sequences.extend_from_slice(&serialize(&txin.sequence));
    }
    let mut outputs = Vec::new();
    for txout in &tx.output {
        outputs.extend_from_slice(&serialize(txout));
    }

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(sha256d::Hash::hash(&prevouts).as_byte_array());
    preimage.extend_from_slice(sha256d::Hash::hash(&sequences).as_byte_array());
    preimage.extend_from_slice(&serialize(&input.previous_output));
    preimage.extend_from_slice(&serialize(script_code));
    preimage.extend_from_slice(&value.to_sat().to_le_bytes());
    preimage.extend_from_slice(&serialize(&input.sequence));
    preimage.extend_from_slice(sha256d::Hash::hash(&outputs).as_byte_array());
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&sighash_type.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage))
}
