//! Crash recovery tests for `RedbStorage`.
//!
//! These tests verify that key material persists across database
//! close/reopen cycles, simulating server restarts.

use keyward_proto::{
    DeviceKeys, KeyId, KeyUsage, OneTimeKey, SignatureSet, UploadSigningKeysRequest, UserId,
};
use keyward_server::{E2eKeys, EngineConfig, KeyError, KeyStore, NoFederation, RedbStorage};
use serde_json::json;
use tempfile::tempdir;

const MASTER_A: &str = "nqOvzeuGWT/sRx3h7+MHoInYj3Uk2LD/unI9kDYcHwk";
const MASTER_B: &str = "Hq6gL+utB4ET+UvD5ci0kgAwsX6qP/zvf8v6OInU5iw";

fn user() -> UserId {
    UserId::parse("@boris:hs").unwrap()
}

fn master_key(public_key: &str) -> UploadSigningKeysRequest {
    serde_json::from_value(json!({
        "master_key": {
            "user_id": "@boris:hs",
            "usage": ["master"],
            "keys": {format!("ed25519:{public_key}"): public_key}
        }
    }))
    .unwrap()
}

#[test]
fn test_one_time_keys_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("keys.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let keys: Vec<_> = (0..10)
            .map(|i| (KeyId::parse(format!("alg1:K{i}")).unwrap(), OneTimeKey::Bare(format!("key{i}"))))
            .collect();
        storage.add_one_time_keys(&user(), "ABC", &keys).unwrap();

        // Claim one before shutdown
        let (claimed, _) = storage.take_one_time_key(&user(), "ABC", "alg1").unwrap().unwrap();
        assert_eq!(claimed.as_str(), "alg1:K0");
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let counts = storage.count_one_time_keys(&user(), "ABC").unwrap();
        assert_eq!(counts.get("alg1"), Some(&9));

        let (next, key) = storage.take_one_time_key(&user(), "ABC", "alg1").unwrap().unwrap();
        assert_eq!(next.as_str(), "alg1:K1");
        assert_eq!(key.key(), "key1");
    }
}

#[test]
fn test_master_generation_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("keys.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new("hs"));
        engine.upload_signing_keys(&user(), &master_key(MASTER_A)).unwrap();
        engine.upload_signing_keys(&user(), &master_key(MASTER_B)).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let stored = storage.load_cross_signing_key(&user(), KeyUsage::Master).unwrap().unwrap();
        assert_eq!(stored.generation, 2);
        assert_eq!(stored.key.public_key(), Some(MASTER_B));

        let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new("hs"));
        assert!(engine.is_cross_signing_key_id(&user(), MASTER_B).unwrap());
        assert!(!engine.is_cross_signing_key_id(&user(), MASTER_A).unwrap());
    }
}

#[test]
fn test_device_deletion_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("keys.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new("hs"));
        engine.check_device_registered(&user(), Some("ABC"), Some("phone")).unwrap();
        engine.check_device_registered(&user(), Some("DEF"), None).unwrap();
        assert!(engine.delete_device(&user(), "ABC").unwrap());
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let devices = storage.load_devices(&user()).unwrap();
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["DEF"]);
    }
}

fn device_keys(signatures: serde_json::Value) -> DeviceKeys {
    serde_json::from_value(json!({
        "user_id": "@boris:hs",
        "device_id": "ABC",
        "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
        "keys": {"ed25519:ABC": "edkey", "curve25519:ABC": "curvekey"},
        "signatures": signatures
    }))
    .unwrap()
}

fn signature_from(key_id: &str, signature: &str) -> SignatureSet {
    let mut set = SignatureSet::new();
    set.insert_if_absent(user(), KeyId::parse(key_id).unwrap(), signature.to_string());
    set
}

#[test]
fn test_added_signatures_survive_restart_and_reupload() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("keys.redb");
    let own = json!({"@boris:hs": {"ed25519:ABC": "own"}});
    let ssk_id = format!("ed25519:{MASTER_B}");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new("hs"));
        engine.upload_signing_keys(&user(), &master_key(MASTER_A)).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.store_device_keys(&user(), &device_keys(own.clone())).unwrap();

        assert!(storage.add_device_signatures(&user(), "ABC", &signature_from(&ssk_id, "by-ssk")).unwrap());
        assert!(!storage.add_device_signatures(&user(), "XYZ", &signature_from(&ssk_id, "x")).unwrap());
        assert!(
            storage
                .add_cross_signing_signatures(&user(), KeyUsage::Master, &signature_from("ed25519:ABC", "by-dev"))
                .unwrap()
        );
        assert!(
            !storage
                .add_cross_signing_signatures(&user(), KeyUsage::SelfSigning, &signature_from("ed25519:ABC", "x"))
                .unwrap()
        );

        // Existing entries win over later additions
        storage.add_device_signatures(&user(), "ABC", &signature_from(&ssk_id, "later")).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.store_device_keys(&user(), &device_keys(own)).unwrap();

        let keys = storage.load_device_key(&user(), "ABC").unwrap().unwrap();
        let ssk_id = KeyId::parse(ssk_id).unwrap();
        assert_eq!(keys.signatures.get(&user(), &ssk_id), Some("by-ssk"));
        assert_eq!(keys.signatures.len(), 2);

        let master = storage.load_cross_signing_key(&user(), KeyUsage::Master).unwrap().unwrap();
        assert_eq!(master.key.signatures.get(&user(), &KeyId::parse("ed25519:ABC").unwrap()), Some("by-dev"));
    }
}

#[test]
fn test_device_id_colliding_with_master_is_rejected() {
    let dir = tempdir().unwrap();
    let storage = RedbStorage::open(dir.path().join("keys.redb")).unwrap();
    let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new("hs"));
    engine.upload_signing_keys(&user(), &master_key(MASTER_A)).unwrap();

    let result = engine.check_device_registered(&user(), Some(MASTER_A), None);
    assert!(matches!(result, Err(KeyError::Validation(_))), "{result:?}");
}
