//! Base64 and key decoding.
//!
//! Keys and signatures are written as unpadded standard base64. Decoding
//! accepts both padded and unpadded input since clients disagree.

use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SigningKey, VerifyingKey};
use keyward_proto::KeyId;

use crate::error::SignatureError;

const UNPADDED: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as unpadded standard base64.
pub fn encode_base64(bytes: impl AsRef<[u8]>) -> String {
    UNPADDED.encode(bytes)
}

/// Decode standard base64, padded or not.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    UNPADDED.decode(encoded)
}

/// Decode the ed25519 public key named by `key_id`.
///
/// The key id's algorithm must be `ed25519`.
pub fn decode_verifying_key(key_id: &KeyId, public_key: &str) -> Result<VerifyingKey, SignatureError> {
    if key_id.algorithm() != "ed25519" {
        return Err(SignatureError::UnsupportedAlgorithm(key_id.algorithm().to_string()));
    }

    let bytes = decode_base64(public_key)
        .map_err(|e| SignatureError::MalformedKey(format!("{key_id}: {e}")))?;

    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        SignatureError::MalformedKey(format!("{key_id}: expected 32 bytes, got {}", bytes.len()))
    })?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SignatureError::MalformedKey(format!("{key_id}: {e}")))
}

/// Unpadded base64 public key of a signing key.
pub fn public_key_base64(signing_key: &SigningKey) -> String {
    encode_base64(signing_key.verifying_key().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_accepts_padding_either_way() {
        assert_eq!(decode_base64("YQ").unwrap(), b"a");
        assert_eq!(decode_base64("YQ==").unwrap(), b"a");
        assert_eq!(encode_base64(b"a"), "YQ");
    }

    #[test]
    fn verifying_key_requires_ed25519() {
        let key_id = KeyId::parse("curve25519:abc").unwrap();
        let err = decode_verifying_key(&key_id, "AAAA").unwrap_err();
        assert_eq!(err, SignatureError::UnsupportedAlgorithm("curve25519".to_string()));
    }

    #[test]
    fn verifying_key_requires_32_bytes() {
        let key_id = KeyId::parse("ed25519:short").unwrap();
        assert!(matches!(
            decode_verifying_key(&key_id, "c2hvcnQ"),
            Err(SignatureError::MalformedKey(_))
        ));
    }

    #[test]
    fn public_key_matches_known_seed() {
        // Seed and public key pair used by the signing fixtures
        let seed = decode_base64("2lonYOM6xYKdEsO+6KrC766xBcHnYnim1x/4LFGF8B0").unwrap();
        let signing_key = SigningKey::from_bytes(&seed.try_into().unwrap());

        assert_eq!(public_key_base64(&signing_key), "nqOvzeuGWT/sRx3h7+MHoInYj3Uk2LD/unI9kDYcHwk");
    }
}
