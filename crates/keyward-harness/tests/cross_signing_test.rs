//! Cross-signing flows between users of the same server.

use std::collections::BTreeMap;

use keyward_harness::{TestUser, sign_master_of};
use keyward_proto::{KeyUsage, QueryKeysRequest, UserId};
use keyward_server::{E2eKeys, EngineConfig, MemoryStorage, NoFederation};
use serde_json::Value;

fn server() -> E2eKeys<MemoryStorage, NoFederation> {
    E2eKeys::new(MemoryStorage::new(), NoFederation, EngineConfig::new("a.test"))
}

fn user(localpart: &str, seed: u64) -> TestUser {
    TestUser::new(UserId::parse(format!("@{localpart}:a.test")).unwrap(), seed)
}

#[tokio::test]
async fn test_user_signing_key_signs_other_users_master() {
    let server = server();
    let alice = user("alice", 1);
    let bob = user("bob", 2);
    for person in [&alice, &bob] {
        server.upload_signing_keys(&person.user_id, &person.signing_keys_upload().unwrap()).unwrap();
    }

    let bob_master = bob.cross_signing_key(KeyUsage::Master).unwrap();
    let signed = sign_master_of(&alice, &bob_master).unwrap();
    let Value::Object(signed) = signed else { panic!("signed master is not an object") };

    let request =
        BTreeMap::from([(bob.user_id.clone(), BTreeMap::from([(bob.public_key(KeyUsage::Master), signed)]))]);
    let response = server.upload_signatures(&alice.user_id, &request).unwrap();
    assert!(response.failures.is_empty(), "{:?}", response.failures);

    let query = QueryKeysRequest { device_keys: BTreeMap::from([(bob.user_id.clone(), vec![])]) };
    let answer = server.query_devices(&query, None).await.unwrap();
    let master = &answer.master_keys[&bob.user_id];
    let alice_key = alice.key_id(KeyUsage::UserSigning).unwrap();
    assert!(master.signatures.contains(&alice.user_id, &alice_key));
}

#[tokio::test]
async fn test_self_signing_key_signs_own_device() {
    let server = server();
    let mut alice = user("alice", 3);
    server.upload_signing_keys(&alice.user_id, &alice.signing_keys_upload().unwrap()).unwrap();
    server.check_device_registered(&alice.user_id, Some("PHONE"), None).unwrap();

    let (device_keys, _) = alice.device_keys("PHONE").unwrap();
    let request = keyward_proto::UploadKeysRequest { device_keys: Some(device_keys.clone()), one_time_keys: None };
    server.upload_keys(&alice.user_id, "PHONE", &request).unwrap();

    let mut copy = serde_json::to_value(&device_keys).unwrap();
    alice.sign(&mut copy, KeyUsage::SelfSigning).unwrap();
    let Value::Object(copy) = copy else { panic!("device keys are not an object") };

    let request = BTreeMap::from([(alice.user_id.clone(), BTreeMap::from([("PHONE".to_string(), copy)]))]);
    assert!(server.upload_signatures(&alice.user_id, &request).unwrap().failures.is_empty());

    // Uploading the same signature again is a no-op
    assert!(server.upload_signatures(&alice.user_id, &request).unwrap().failures.is_empty());

    let devices = server.query_local_devices(&BTreeMap::from([(alice.user_id.clone(), None)])).unwrap();
    let stored = &devices[&alice.user_id]["PHONE"];
    let self_signing_id = alice.key_id(KeyUsage::SelfSigning).unwrap();
    assert!(stored.signatures.contains(&alice.user_id, &self_signing_id));
    assert_eq!(stored.signatures.len(), 2);
}

#[tokio::test]
async fn test_replaced_master_invalidates_user_signing_key() {
    let server = server();
    let alice = user("alice", 4);
    let bob = user("bob", 5);
    for person in [&alice, &bob] {
        server.upload_signing_keys(&person.user_id, &person.signing_keys_upload().unwrap()).unwrap();
    }

    // Alice rotates to a new master without new dependents
    let rotated = user("alice", 6);
    let new_master = keyward_proto::UploadSigningKeysRequest {
        master_key: Some(rotated.cross_signing_key(KeyUsage::Master).unwrap()),
        ..Default::default()
    };
    server.upload_signing_keys(&alice.user_id, &new_master).unwrap();

    let bob_master = bob.cross_signing_key(KeyUsage::Master).unwrap();
    let Value::Object(signed) = sign_master_of(&alice, &bob_master).unwrap() else {
        panic!("signed master is not an object")
    };
    let request =
        BTreeMap::from([(bob.user_id.clone(), BTreeMap::from([(bob.public_key(KeyUsage::Master), signed)]))]);
    let response = server.upload_signatures(&alice.user_id, &request).unwrap();

    let failure = &response.failures[&bob.user_id][&bob.public_key(KeyUsage::Master)];
    assert_eq!(failure.errcode, "M_INVALID_SIGNATURE");
}

#[tokio::test]
async fn test_master_reupload_cannot_plant_signatures() {
    let server = server();
    let alice = user("alice", 7);
    let bob = user("bob", 8);
    for person in [&alice, &bob] {
        server.upload_signing_keys(&person.user_id, &person.signing_keys_upload().unwrap()).unwrap();
    }

    // Bob re-uploads his unchanged master carrying a made-up signature from alice
    let alice_key = alice.key_id(KeyUsage::UserSigning).unwrap();
    let mut planted = bob.cross_signing_key(KeyUsage::Master).unwrap();
    planted.signatures.insert_if_absent(alice.user_id.clone(), alice_key.clone(), "Zm9yZ2Vk".to_string());
    let reupload = keyward_proto::UploadSigningKeysRequest { master_key: Some(planted), ..Default::default() };
    server.upload_signing_keys(&bob.user_id, &reupload).unwrap();

    let bob_master = bob.cross_signing_key(KeyUsage::Master).unwrap();
    let signed = sign_master_of(&alice, &bob_master).unwrap();
    let real = signed["signatures"][alice.user_id.as_str()][alice_key.as_str()].as_str().unwrap().to_string();
    let Value::Object(signed) = signed else { panic!("signed master is not an object") };
    let request =
        BTreeMap::from([(bob.user_id.clone(), BTreeMap::from([(bob.public_key(KeyUsage::Master), signed)]))]);
    let response = server.upload_signatures(&alice.user_id, &request).unwrap();
    assert!(response.failures.is_empty(), "{:?}", response.failures);

    let query = QueryKeysRequest { device_keys: BTreeMap::from([(bob.user_id.clone(), vec![])]) };
    let answer = server.query_devices(&query, None).await.unwrap();
    let master = &answer.master_keys[&bob.user_id];
    assert_eq!(master.signatures.get(&alice.user_id, &alice_key), Some(real.as_str()));
}

#[tokio::test]
async fn test_device_reupload_keeps_self_signing_signature() {
    let server = server();
    let mut alice = user("alice", 9);
    server.upload_signing_keys(&alice.user_id, &alice.signing_keys_upload().unwrap()).unwrap();
    server.check_device_registered(&alice.user_id, Some("TABLET"), None).unwrap();

    let (device_keys, _) = alice.device_keys("TABLET").unwrap();
    let upload = keyward_proto::UploadKeysRequest { device_keys: Some(device_keys.clone()), one_time_keys: None };
    server.upload_keys(&alice.user_id, "TABLET", &upload).unwrap();

    let mut copy = serde_json::to_value(&device_keys).unwrap();
    alice.sign(&mut copy, KeyUsage::SelfSigning).unwrap();
    let Value::Object(copy) = copy else { panic!("device keys are not an object") };
    let request = BTreeMap::from([(alice.user_id.clone(), BTreeMap::from([("TABLET".to_string(), copy)]))]);
    assert!(server.upload_signatures(&alice.user_id, &request).unwrap().failures.is_empty());

    // The client re-uploads the same keys, self-signed only
    server.upload_keys(&alice.user_id, "TABLET", &upload).unwrap();

    let devices = server.query_local_devices(&BTreeMap::from([(alice.user_id.clone(), None)])).unwrap();
    let stored = &devices[&alice.user_id]["TABLET"];
    assert!(stored.signatures.contains(&alice.user_id, &alice.key_id(KeyUsage::SelfSigning).unwrap()));
    assert_eq!(stored.signatures.len(), 2);
}
