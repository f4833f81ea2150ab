//! `did:key` encoding of Ed25519 public keys.
//!
//! A key travels as `did:key:z<base58btc(0xed 0x01 || 32 key bytes)>`.

use crate::error::{ExchangeError, Result};
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};

const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];
const DID_KEY_PREFIX: &str = "did:key:";

pub fn encode_did_key(key: &VerifyingKey) -> String {
    let mut bytes = Vec::with_capacity(ED25519_MULTICODEC.len() + PUBLIC_KEY_LENGTH);
    bytes.extend_from_slice(&ED25519_MULTICODEC);
    bytes.extend_from_slice(key.as_bytes());
    format!("{}z{}", DID_KEY_PREFIX, bs58::encode(bytes).into_string())
}

/// Accepts either a full `did:key:` or a bare multibase value as found in DID documents.
pub fn decode_did_key(value: &str) -> Result<VerifyingKey> {
    let multibase = value.strip_prefix(DID_KEY_PREFIX).unwrap_or(value);
    let encoded = multibase
        .strip_prefix('z')
        .ok_or_else(|| ExchangeError::Crypto(format!("Unsupported multibase encoding: {}", value)))?;

    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| ExchangeError::Crypto(format!("Invalid base58 key: {}", e)))?;

    if bytes.len() != ED25519_MULTICODEC.len() + PUBLIC_KEY_LENGTH
        || bytes[..ED25519_MULTICODEC.len()] != ED25519_MULTICODEC
    {
        return Err(ExchangeError::Crypto(format!(
            "Unsupported key type (only Ed25519 is accepted): {}",
            value
        )));
    }

    let raw: [u8; PUBLIC_KEY_LENGTH] = bytes[ED25519_MULTICODEC.len()..]
        .try_into()
        .map_err(|_| ExchangeError::Crypto("Malformed Ed25519 key".to_string()))?;

    Ok(VerifyingKey::from_bytes(&raw)?)
}

pub fn signing_key_from_hex(hex_key: &str) -> Result<SigningKey> {
    let bytes = hex::decode(hex_key.trim())?;
    let raw: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        ExchangeError::Config(format!(
            "Signing key must be {} bytes, got {}",
            SECRET_KEY_LENGTH,
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&raw))
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_key_roundtrip() {
        let key = generate_signing_key();
        let did = encode_did_key(&key.verifying_key());

        assert!(did.starts_with("did:key:z6Mk"));
        assert_eq!(decode_did_key(&did).unwrap(), key.verifying_key());

        let bare = did.trim_start_matches(DID_KEY_PREFIX);
        assert_eq!(decode_did_key(bare).unwrap(), key.verifying_key());
    }

    #[test]
    fn test_rejects_other_key_types() {
        // secp256k1 multicodec prefix
        let mut bytes = vec![0xe7, 0x01];
        bytes.extend_from_slice(&[2u8; 33]);
        let did = format!("did:key:z{}", bs58::encode(bytes).into_string());

        assert!(matches!(decode_did_key(&did), Err(ExchangeError::Crypto(_))));
        assert!(decode_did_key("did:key:m1234").is_err());
    }

    #[test]
    fn test_signing_key_from_hex() {
        let key = generate_signing_key();
        let restored = signing_key_from_hex(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(restored.verifying_key(), key.verifying_key());

        assert!(matches!(signing_key_from_hex("abcd"), Err(ExchangeError::Config(_))));
        assert!(signing_key_from_hex("zz").is_err());
    }
}
