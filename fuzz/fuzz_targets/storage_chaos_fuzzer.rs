//! Fuzz target for the key store under storage failures
//!
//! Drives `KeyStore` operations through `ChaoticStorage` and compares the
//! surviving state against a simple model.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Interleaved one-time key uploads, claims and device deletions
//! - Master key replacement racing dependent uploads
//!
//! # Invariants
//!
//! - Storage errors propagate as `Result::Err`, NEVER panics
//! - A failed operation changes nothing (atomic or nothing)
//! - Every claimed key was stored and is claimed at most once
//! - Master generation only increases

#![no_main]

use std::collections::{BTreeMap, BTreeSet};

use arbitrary::Arbitrary;
use ed25519_dalek::SigningKey;
use keyward_crypto::public_key_base64;
use keyward_proto::{CrossSigningKey, KeyId, KeyUsage, OneTimeKey, UserId};
use keyward_server::{ChaoticStorage, CrossSigningUpdate, KeyStore, MemoryStorage};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Upload a batch of one-time keys to a device
    AddKeys { device: u8, first: u8, count: u8 },
    /// Claim one key of an algorithm
    Take { device: u8, algorithm: u8 },
    /// Delete a device with its keys
    DeleteDevice { device: u8 },
    /// Replace (or re-upload) the master key
    UploadMaster { seed: u8 },
}

fn device_name(device: u8) -> String {
    format!("DEV{}", device % 3)
}

fn master_key(user: &UserId, seed: u8) -> Option<CrossSigningKey> {
    let public_key = public_key_base64(&SigningKey::from_bytes(&[seed % 4; 32]));
    serde_json::from_value(serde_json::json!({
        "user_id": user,
        "usage": [KeyUsage::Master],
        "keys": {format!("ed25519:{public_key}"): public_key}
    }))
    .ok()
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = (scenario.failure_rate_tenth % 10) as f64 / 10.0;
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);
    let user = UserId::parse("@chaos:hs").expect("valid user id");

    // Model: device → stored key ids
    let mut model: BTreeMap<String, BTreeSet<KeyId>> = BTreeMap::new();
    let mut claimed: BTreeSet<(String, KeyId)> = BTreeSet::new();
    let mut generation = 0u64;

    for operation in scenario.operations.into_iter().take(64) {
        match operation {
            ChaosOperation::AddKeys { device, first, count } => {
                let device = device_name(device);
                let batch: Vec<(KeyId, OneTimeKey)> = (first..first.saturating_add(count % 8))
                    .filter_map(|i| {
                        let id = KeyId::new(&format!("alg{}", i % 2), &format!("K{i:03}")).ok()?;
                        Some((id, OneTimeKey::Bare(format!("key{i}"))))
                    })
                    .collect();

                if storage.add_one_time_keys(&user, &device, &batch).is_ok() {
                    let stored = model.entry(device.clone()).or_default();
                    for (id, _) in batch {
                        // Claimed ids may be re-uploaded; they are new keys then
                        claimed.remove(&(device.clone(), id.clone()));
                        stored.insert(id);
                    }
                }
            },

            ChaosOperation::Take { device, algorithm } => {
                let device = device_name(device);
                let algorithm = format!("alg{}", algorithm % 2);

                if let Ok(Some((id, _))) = storage.take_one_time_key(&user, &device, &algorithm) {
                    let stored = model.entry(device.clone()).or_default();
                    assert!(stored.remove(&id), "claimed a key that was never stored");
                    assert_eq!(id.algorithm(), algorithm);
                    assert!(claimed.insert((device, id)), "key claimed twice");
                }
            },

            ChaosOperation::DeleteDevice { device } => {
                let device = device_name(device);
                if storage.delete_device(&user, &device).is_ok() {
                    model.remove(&device);
                }
            },

            ChaosOperation::UploadMaster { seed } => {
                let Some(master) = master_key(&user, seed) else { continue };
                let update = CrossSigningUpdate { master: Some(master), ..Default::default() };

                if storage.apply_cross_signing_update(&user, &update).is_ok() {
                    let stored = storage
                        .inner()
                        .load_cross_signing_key(&user, KeyUsage::Master)
                        .expect("memory storage")
                        .expect("master just stored");
                    assert!(stored.generation >= generation, "master generation went backwards");
                    generation = stored.generation;
                }
            },
        }
    }

    for (device, ids) in &model {
        let counts = storage.inner().count_one_time_keys(&user, device).expect("memory storage");
        let total: u64 = counts.values().sum();
        assert_eq!(total as usize, ids.len(), "stored keys diverged from model for {device}");
    }
});
