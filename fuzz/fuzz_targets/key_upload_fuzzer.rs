//! Fuzz target for key upload parsing and one-time key immutability
//!
//! Harden the client-facing upload path against arbitrary request bodies.
//!
//! # Strategy
//!
//! - Arbitrary bytes as an upload body (parser robustness)
//! - Structured uploads mixing bare and signed one-time keys
//! - Re-uploads with changed key material or changed signatures
//!
//! # Invariants
//!
//! - NEVER panic on malformed bodies
//! - An accepted upload can be repeated verbatim
//! - A rejected upload leaves the stored counts unchanged
//! - A stored one-time key's material never changes

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use keyward_proto::{KeyId, OneTimeKey, SignedKey, UploadKeysRequest, UserId};
use keyward_server::{DeviceKeyManager, KeyError, MemoryStorage};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum FuzzInput {
    RawBody(Vec<u8>),
    Uploads(Vec<Upload>),
}

#[derive(Debug, Clone, Arbitrary)]
struct Upload {
    keys: Vec<FuzzKey>,
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzKey {
    algorithm: u8,
    id: u8,
    material: u8,
    signed: bool,
    signature: u8,
}

impl FuzzKey {
    fn key_id(&self) -> Option<KeyId> {
        KeyId::new(&format!("alg{}", self.algorithm % 3), &format!("k{}", self.id % 8)).ok()
    }

    fn key(&self) -> OneTimeKey {
        let key = format!("key{}", self.material % 4);
        if self.signed {
            OneTimeKey::Signed(SignedKey {
                key,
                signatures: Some(serde_json::json!({
                    "@fuzz:hs": {"ed25519:DEV": format!("sig{}", self.signature)}
                })),
                other: serde_json::Map::new(),
            })
        } else {
            OneTimeKey::Bare(key)
        }
    }
}

fn upload(
    manager: &DeviceKeyManager<MemoryStorage>,
    user: &UserId,
    request: &UploadKeysRequest,
) -> Result<BTreeMap<String, u64>, KeyError> {
    manager.upload_keys(user, "DEV", request).map(|response| response.one_time_key_counts)
}

fuzz_target!(|input: FuzzInput| {
    let user = UserId::parse("@fuzz:hs").expect("valid user id");
    let manager = DeviceKeyManager::new(MemoryStorage::new(), "hs");

    match input {
        FuzzInput::RawBody(bytes) => {
            let Ok(request) = serde_json::from_slice::<UploadKeysRequest>(&bytes) else {
                return;
            };

            if upload(&manager, &user, &request).is_ok() {
                assert!(upload(&manager, &user, &request).is_ok(), "verbatim re-upload rejected");
            }
        },

        FuzzInput::Uploads(uploads) => {
            let mut stored: BTreeMap<KeyId, String> = BTreeMap::new();

            for upload_input in uploads {
                let keys: BTreeMap<KeyId, OneTimeKey> = upload_input
                    .keys
                    .iter()
                    .filter_map(|k| k.key_id().map(|id| (id, k.key())))
                    .collect();
                let conflicts = keys
                    .iter()
                    .any(|(id, key)| stored.get(id).is_some_and(|material| material != key.key()));

                let before = manager.one_time_key_counts(&user, "DEV").expect("memory storage");
                let request = UploadKeysRequest { device_keys: None, one_time_keys: Some(keys.clone()) };

                match upload(&manager, &user, &request) {
                    Ok(_) => {
                        assert!(!conflicts, "changed one-time key accepted");
                        for (id, key) in keys {
                            stored.entry(id).or_insert_with(|| key.key().to_string());
                        }
                    },
                    Err(KeyError::Conflict(_)) => {
                        assert!(conflicts, "unchanged one-time keys rejected");
                        let after = manager.one_time_key_counts(&user, "DEV").expect("memory storage");
                        assert_eq!(before, after, "rejected upload changed stored keys");
                    },
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }

            let total: u64 =
                manager.one_time_key_counts(&user, "DEV").expect("memory storage").values().sum();
            assert_eq!(total as usize, stored.len());
        },
    }
});
