//! Fuzz target for key object signature verification
//!
//! Prevent signature forgery and verification bypass (CRITICAL security
//! boundary)
//!
//! # Strategy
//!
//! - Corrupted signatures: Flip bits in valid signature bytes
//! - Wrong keys: Sign with one key, verify with another
//! - Tampered data: Modify signed fields after signing
//! - Malformed signatures: Wrong length, bad base64, empty
//!
//! # Invariants
//!
//! - Valid signature MUST verify
//! - Corrupted signature (any bit flip) MUST reject
//! - Signature from wrong key MUST reject
//! - Tampered object MUST reject
//! - Changes to `signatures` or `unsigned` MUST NOT affect verification
//! - NEVER panic on invalid signature input

#![no_main]

use arbitrary::Arbitrary;
use ed25519_dalek::SigningKey;
use keyward_crypto::{SignatureEngine, decode_base64, encode_base64, public_key_base64};
use keyward_proto::{KeyId, UserId};
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    seed: [u8; 32],
    device_id: String,
    attack: SignatureAttack,
}

#[derive(Debug, Clone, Arbitrary)]
enum SignatureAttack {
    CorruptedSignature { byte_offset: u8, bit_offset: u8 },
    WrongKey { other_seed: [u8; 32] },
    TamperedData { field: TamperedField },
    MalformedSignature { malformed: MalformedType },
    IgnoredFields { unsigned: String, extra_signature: String },
}

#[derive(Debug, Clone, Arbitrary)]
enum TamperedField {
    DeviceId(String),
    UserId,
    Algorithm(String),
    Key(String),
}

#[derive(Debug, Clone, Arbitrary)]
enum MalformedType {
    Empty,
    Truncated(u8),
    Extended(Vec<u8>),
    NotBase64(String),
}

fuzz_target!(|input: FuzzInput| {
    let signer = match UserId::parse("@fuzz:example.org") {
        Ok(signer) => signer,
        Err(_) => return,
    };
    let device_id: String = input.device_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
    if device_id.is_empty() {
        return;
    }

    let signing_key = SigningKey::from_bytes(&input.seed);
    let public_key = public_key_base64(&signing_key);
    let key_id = match KeyId::new("ed25519", &public_key) {
        Ok(key_id) => key_id,
        Err(_) => return,
    };

    let object = json!({
        "user_id": signer,
        "device_id": device_id,
        "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
        "keys": {format!("ed25519:{device_id}"): "base64+key"}
    });

    let signature = SignatureEngine::sign(&object, &signing_key).expect("object is canonical");
    assert!(
        SignatureEngine::check_detached(&object, &signer, &key_id, &signature, &public_key).is_ok(),
        "valid signature rejected"
    );

    match input.attack {
        SignatureAttack::CorruptedSignature { byte_offset, bit_offset } => {
            let mut bytes = decode_base64(&signature).expect("own signature decodes");
            let index = byte_offset as usize % bytes.len();
            bytes[index] ^= 1 << (bit_offset % 8);
            let corrupted = encode_base64(&bytes);

            assert!(
                SignatureEngine::check_detached(&object, &signer, &key_id, &corrupted, &public_key)
                    .is_err(),
                "corrupted signature accepted"
            );
        },

        SignatureAttack::WrongKey { other_seed } => {
            if other_seed == input.seed {
                return;
            }
            let other = SigningKey::from_bytes(&other_seed);
            let forged = SignatureEngine::sign(&object, &other).expect("object is canonical");

            assert!(
                SignatureEngine::check_detached(&object, &signer, &key_id, &forged, &public_key)
                    .is_err(),
                "signature from wrong key accepted"
            );
        },

        SignatureAttack::TamperedData { field } => {
            let mut tampered = object.clone();
            match field {
                TamperedField::DeviceId(id) => tampered["device_id"] = Value::String(id),
                TamperedField::UserId => tampered["user_id"] = json!("@mallory:example.org"),
                TamperedField::Algorithm(alg) => tampered["algorithms"] = json!([alg]),
                TamperedField::Key(key) => {
                    tampered["keys"][format!("ed25519:{device_id}")] = Value::String(key);
                },
            }
            if tampered == object {
                return;
            }

            assert!(
                SignatureEngine::check_detached(&tampered, &signer, &key_id, &signature, &public_key)
                    .is_err(),
                "tampered object accepted"
            );
        },

        SignatureAttack::MalformedSignature { malformed } => {
            let bad = match malformed {
                MalformedType::Empty => String::new(),
                MalformedType::Truncated(len) => {
                    let bytes = decode_base64(&signature).expect("own signature decodes");
                    encode_base64(&bytes[..(len as usize % bytes.len())])
                },
                MalformedType::Extended(extra) => {
                    let mut bytes = decode_base64(&signature).expect("own signature decodes");
                    if extra.is_empty() {
                        return;
                    }
                    bytes.extend(extra);
                    encode_base64(&bytes)
                },
                MalformedType::NotBase64(s) => s,
            };
            if bad == signature {
                return;
            }

            assert!(
                SignatureEngine::check_detached(&object, &signer, &key_id, &bad, &public_key)
                    .is_err(),
                "malformed signature accepted"
            );
        },

        SignatureAttack::IgnoredFields { unsigned, extra_signature } => {
            let mut decorated = object.clone();
            decorated["unsigned"] = json!({"note": unsigned});
            decorated["signatures"] = json!({
                "@other:example.org": {"ed25519:OTHER": extra_signature},
                signer.as_str(): {key_id.as_str(): signature}
            });

            assert!(
                SignatureEngine::check(&decorated, &signer, &key_id, &public_key).is_ok(),
                "signatures or unsigned changed the signed bytes"
            );
        },
    }
});
