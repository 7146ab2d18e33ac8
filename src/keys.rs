use bitcoin::{
    address::NetworkUnchecked, network::Network as BitcoinNetwork, secp256k1::{Secp256k1, Signing},
    Address, NetworkKind, PrivateKey, PublicKey, ScriptBuf,
};

use crate::error::AppError;

/// 秘密鍵の指定方法 (WIF / 16進数文字列、または復号済みの鍵)
#[derive(Debug, Clone)]
pub enum PaymentKey {
    Encoded(String),
    Key(PrivateKey),
}

impl From<&str> for PaymentKey {
    fn from(s: &str) -> Self {
        PaymentKey::Encoded(s.to_string())
    }
}

impl From<String> for PaymentKey {
    fn from(s: String) -> Self {
        PaymentKey::Encoded(s)
    }
}

impl From<PrivateKey> for PaymentKey {
    fn from(key: PrivateKey) -> Self {
        PaymentKey::Key(key)
    }
}

/// 署名鍵と、そこから導出した受け取りアドレス
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    pub fn from_key<C: Signing>(
        key: &PaymentKey,
        network: BitcoinNetwork,
        secp: &Secp256k1<C>,
    ) -> Result<Self, AppError> {
        let private_key = match key {
            PaymentKey::Encoded(encoded) => decode_private_key(encoded, network)?,
            PaymentKey::Key(private_key) => *private_key,
        };
        if private_key.network != NetworkKind::from(network) {
            return Err(AppError::NetworkMismatch {
                configured: format!("{:?}", network),
                inferred: format!("{:?}", private_key.network),
            });
        }
        let public_key = private_key.public_key(secp);
        let address = Address::p2pkh(public_key.pubkey_hash(), private_key.network);
        log::debug!("鍵を読み込みました。アドレス: {}", address);

        Ok(KeyPair { private_key, public_key, address })
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn locking_script(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

fn decode_private_key(encoded: &str, network: BitcoinNetwork) -> Result<PrivateKey, AppError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(AppError::Configuration("有効な秘密鍵を指定してください".to_string()));
    }
    // 64桁の16進数は生の秘密鍵として扱う
    if encoded.len() == 64 && encoded.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(encoded)
            .map_err(|e| AppError::Configuration(format!("秘密鍵のデコード失敗: {}", e)))?;
        return PrivateKey::from_slice(&bytes, network)
            .map_err(|e| AppError::Configuration(format!("秘密鍵が範囲外です: {}", e)));
    }
    PrivateKey::from_wif(encoded).map_err(|e| AppError::Configuration(format!("WIF形式の秘密鍵ではありません: {}", e)))
}

pub fn parse_address(address: &str, network: BitcoinNetwork) -> Result<Address, AppError> {
    let unchecked: Address<NetworkUnchecked> = address.parse()?;
    Ok(unchecked.require_network(network)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "L4JEtjzPy1uHdmDN4cV9K8WReWX2QaSYLEPzoZCmKRW6Hpe1zWgo";

    #[test]
    fn wif_key_derives_p2pkh_address() {
        let secp = Secp256k1::new();
        let keys = KeyPair::from_key(&KEY.into(), BitcoinNetwork::Bitcoin, &secp).unwrap();
        assert_eq!(keys.address().to_string(), "1ML7LKjt3MMsZWVeuVbUZqoLCezqdAFW9e");
        assert!(keys.locking_script().is_p2pkh());
    }

    #[test]
    fn hex_key_matches_wif_key() {
        let secp = Secp256k1::new();
        let wif = PrivateKey::from_wif(KEY).unwrap();
        let hex_key = hex::encode(wif.to_bytes());
        let keys = KeyPair::from_key(&hex_key.into(), BitcoinNetwork::Bitcoin, &secp).unwrap();
        assert_eq!(keys.address().to_string(), "1ML7LKjt3MMsZWVeuVbUZqoLCezqdAFW9e");
    }

    #[test]
    fn empty_key_is_configuration_error() {
        let secp = Secp256k1::new();
        let err = KeyPair::from_key(&"".into(), BitcoinNetwork::Bitcoin, &secp).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn invalid_keys_are_configuration_errors() {
        let secp = Secp256k1::new();
        let bad_wif = KeyPair::from_key(&"L4JEtjzPy1uHdmDN4cV9K8WReWX2QaSYLEPzoZCmKRW6Hpe1zWgX".into(), BitcoinNetwork::Bitcoin, &secp);
        assert!(matches!(bad_wif, Err(AppError::Configuration(_))));

        let out_of_range = "f".repeat(64);
        let result = KeyPair::from_key(&out_of_range.into(), BitcoinNetwork::Bitcoin, &secp);
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn mainnet_key_on_testnet_is_rejected() {
        let secp = Secp256k1::new();
        let err = KeyPair::from_key(&KEY.into(), BitcoinNetwork::Testnet, &secp).unwrap_err();
        assert!(matches!(err, AppError::NetworkMismatch { .. }));
    }

    #[test]
    fn address_for_other_network_is_rejected() {
        assert!(parse_address("1NbL18PU1r3kjVzLzh44Hkuj6nc36RBZ8Z", BitcoinNetwork::Bitcoin).is_ok());
        assert!(parse_address("1NbL18PU1r3kjVzLzh44Hkuj6nc36RBZ8Z", BitcoinNetwork::Testnet).is_err());
    }
}
