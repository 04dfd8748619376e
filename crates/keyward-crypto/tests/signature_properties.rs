//! Property tests for signature verification.
//!
//! A signature is accepted only for the exact canonical bytes it was made
//! over, with the exact key that made it.

use keyward_crypto::{
    SignatureEngine, SigningKey, decode_base64, encode_base64, public_key_base64,
};
use keyward_proto::{KeyId, UserId};
use proptest::prelude::*;
use serde_json::json;

fn fixture(seed: [u8; 32], device_id: &str) -> (SigningKey, UserId, KeyId, serde_json::Value) {
    let signing_key = SigningKey::from_bytes(&seed);
    let signer = UserId::parse("@boris:example.org").unwrap();
    let key_id = KeyId::new("ed25519", &public_key_base64(&signing_key)).unwrap();
    let object = json!({
        "user_id": "@boris:example.org",
        "device_id": device_id,
        "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
        "keys": {format!("ed25519:{device_id}"): "base64+key"}
    });
    (signing_key, signer, key_id, object)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any single-bit corruption of a signature is rejected
    #[test]
    fn prop_bit_flip_rejected(
        seed in any::<[u8; 32]>(),
        device_id in "[A-Z]{1,10}",
        bit in 0usize..512,
    ) {
        let (signing_key, signer, key_id, object) = fixture(seed, &device_id);
        let public_key = public_key_base64(&signing_key);

        let signature = SignatureEngine::sign(&object, &signing_key)?;
        prop_assert!(
            SignatureEngine::check_detached(&object, &signer, &key_id, &signature, &public_key)
                .is_ok()
        );

        let mut bytes = decode_base64(&signature).unwrap();
        bytes[bit / 8] ^= 1 << (bit % 8);
        let corrupted = encode_base64(&bytes);

        prop_assert!(
            SignatureEngine::check_detached(&object, &signer, &key_id, &corrupted, &public_key)
                .is_err()
        );
    }

    /// Property: key order in the object never affects verification
    #[test]
    fn prop_field_order_irrelevant(seed in any::<[u8; 32]>(), device_id in "[A-Z]{1,10}") {
        let (signing_key, signer, key_id, object) = fixture(seed, &device_id);
        let signature = SignatureEngine::sign(&object, &signing_key)?;

        let reordered: serde_json::Value = serde_json::from_str(&format!(
            r#"{{"keys":{{"ed25519:{device_id}":"base64+key"}},"algorithms":["m.olm.v1.curve25519-aes-sha2"],"device_id":"{device_id}","user_id":"@boris:example.org"}}"#
        )).unwrap();

        prop_assert!(SignatureEngine::check_detached(
            &reordered,
            &signer,
            &key_id,
            &signature,
            &public_key_base64(&signing_key),
        ).is_ok());
    }

    /// Property: a signature never verifies under a different key
    #[test]
    fn prop_other_key_rejected(
        seed in any::<[u8; 32]>(),
        other_seed in any::<[u8; 32]>(),
        device_id in "[A-Z]{1,10}",
    ) {
        prop_assume!(seed != other_seed);
        let (signing_key, signer, key_id, object) = fixture(seed, &device_id);
        let other = SigningKey::from_bytes(&other_seed);

        let signature = SignatureEngine::sign(&object, &signing_key)?;
        prop_assert!(SignatureEngine::check_detached(
            &object,
            &signer,
            &key_id,
            &signature,
            &public_key_base64(&other),
        ).is_err());
    }
}
