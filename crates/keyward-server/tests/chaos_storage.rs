//! Chaos property tests for `KeyStore` implementations
//!
//! These tests verify that storage implementations keep their atomicity
//! guarantees when wrapped in `ChaoticStorage`:
//! - A one-time key batch is stored completely or not at all
//! - A claimed key is removed exactly when the claim succeeds
//! - Uploads through the engine never leave partial state behind

use std::collections::BTreeSet;

use keyward_proto::{KeyId, OneTimeKey, UploadKeysRequest, UserId};
use keyward_server::{
    ChaoticStorage, DeviceKeyManager, KeyError, KeyStore, MemoryStorage, RedbStorage,
    StorageError,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn user() -> UserId {
    UserId::parse("@boris:hs").unwrap()
}

fn batch(start: usize, len: usize) -> Vec<(KeyId, OneTimeKey)> {
    (start..start + len)
        .map(|i| {
            let id = KeyId::parse(format!("signed_curve25519:K{i:04}")).unwrap();
            (id, OneTimeKey::Bare(format!("key{i}")))
        })
        .collect()
}

#[test]
fn prop_storage_chaos_atomic_batches() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        batch_count in 1usize..20,
        batch_len in 1usize..10,
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);

        let mut stored = 0usize;
        for b in 0..batch_count {
            match storage.add_one_time_keys(&user(), "ABC", &batch(b * batch_len, batch_len)) {
                Ok(()) => stored += batch_len,
                Err(StorageError::Io(_)) => {},
                Err(e) => panic!("Unexpected error: {e:?}"),
            }
        }

        // ORACLE: the inner store holds exactly the batches that succeeded
        prop_assert_eq!(storage.inner().total_one_time_keys(), stored);
    });
}

#[test]
fn prop_storage_chaos_claims_are_exact() {
    proptest!(|(
        failure_rate in 0.0..0.6,
        seed in any::<u64>(),
        key_count in 1usize..30,
        attempts in 1usize..60,
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
        storage.inner().add_one_time_keys(&user(), "ABC", &batch(0, key_count)).unwrap();

        let mut claimed = BTreeSet::new();
        for _ in 0..attempts {
            match storage.take_one_time_key(&user(), "ABC", "signed_curve25519") {
                Ok(Some((key_id, _))) => prop_assert!(claimed.insert(key_id)),
                Ok(None) => prop_assert_eq!(claimed.len(), key_count),
                Err(StorageError::Io(_)) => {},
                Err(e) => panic!("Unexpected error: {e:?}"),
            }
        }

        // ORACLE: every key is either claimed once or still stored
        prop_assert_eq!(storage.inner().total_one_time_keys() + claimed.len(), key_count);
    });
}

#[test]
fn prop_storage_chaos_upload_through_engine() {
    proptest!(|(
        failure_rate in 0.0..0.5,
        seed in any::<u64>(),
        uploads in 1usize..15,
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
        let manager = DeviceKeyManager::new(storage.clone(), "hs");

        let mut stored = 0usize;
        for u in 0..uploads {
            let request = UploadKeysRequest {
                device_keys: None,
                one_time_keys: Some(batch(u * 5, 5).into_iter().collect()),
            };

            // The count read after a successful write may itself fail
            match manager.upload_keys(&user(), "ABC", &request) {
                Ok(_) => stored += 5,
                Err(KeyError::Storage(_)) => {
                    stored = storage.inner().total_one_time_keys();
                },
                Err(e) => panic!("Unexpected error: {e:?}"),
            }

            prop_assert_eq!(storage.inner().total_one_time_keys() % 5, 0);
        }

        prop_assert_eq!(storage.inner().total_one_time_keys(), stored);
    });
}

#[test]
fn test_redb_storage_with_chaos() {
    let dir = tempdir().unwrap();
    let storage =
        ChaoticStorage::with_seed(RedbStorage::open(dir.path().join("chaos.redb")).unwrap(), 0.3, 7);

    let mut stored = 0u64;
    for b in 0..50 {
        if storage.add_one_time_keys(&user(), "ABC", &batch(b * 4, 4)).is_ok() {
            stored += 4;
        }
    }

    let counts = storage.inner().count_one_time_keys(&user(), "ABC").unwrap();
    assert_eq!(counts.get("signed_curve25519").copied().unwrap_or(0), stored);
    assert!(storage.operation_count() >= 50);
}
