//! Signing fixtures.
//!
//! A [`TestUser`] owns real ed25519 keys derived from a seed, so tests can
//! build correctly signed key objects without hand-written signatures.
//! The same seed always yields the same keys.

use std::collections::BTreeMap;

use keyward_crypto::{SignatureEngine, SignatureError, SigningKey, encode_base64, public_key_base64};
use keyward_proto::{
    CrossSigningKey, DeviceKeys, KeyId, KeyUsage, OneTimeKey, ProtocolError, UploadKeysRequest,
    UploadSigningKeysRequest, UserId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Value, json};
use thiserror::Error;

/// Failure building a fixture.
#[derive(Error, Debug)]
pub enum FixtureError {
    /// Signing failed
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Generated identifier was rejected
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Key object did not round-trip through JSON
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Algorithms advertised by fixture devices.
pub const DEVICE_ALGORITHMS: [&str; 2] = ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"];

/// Algorithm of fixture one-time keys.
pub const ONE_TIME_KEY_ALGORITHM: &str = "signed_curve25519";

/// A user with seeded cross-signing keys.
pub struct TestUser {
    /// The user id
    pub user_id: UserId,
    /// Master signing key
    pub master: SigningKey,
    /// Self-signing key
    pub self_signing: SigningKey,
    /// User-signing key
    pub user_signing: SigningKey,
    rng: ChaCha8Rng,
}

impl TestUser {
    /// Create a user whose keys are derived from `seed`.
    pub fn new(user_id: UserId, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let master = SigningKey::from_bytes(&rng.r#gen());
        let self_signing = SigningKey::from_bytes(&rng.r#gen());
        let user_signing = SigningKey::from_bytes(&rng.r#gen());

        Self { user_id, master, self_signing, user_signing, rng }
    }

    /// Signing key for `usage`.
    pub fn signing_key(&self, usage: KeyUsage) -> &SigningKey {
        match usage {
            KeyUsage::Master => &self.master,
            KeyUsage::SelfSigning => &self.self_signing,
            KeyUsage::UserSigning => &self.user_signing,
        }
    }

    /// Public key of `usage`, which is also its key identifier.
    pub fn public_key(&self, usage: KeyUsage) -> String {
        public_key_base64(self.signing_key(usage))
    }

    /// The `ed25519:<public key>` id of `usage`.
    pub fn key_id(&self, usage: KeyUsage) -> Result<KeyId, FixtureError> {
        Ok(KeyId::new("ed25519", &self.public_key(usage))?)
    }

    /// Unsigned cross-signing key object for `usage`.
    pub fn cross_signing_key(&self, usage: KeyUsage) -> Result<CrossSigningKey, FixtureError> {
        let public_key = self.public_key(usage);
        let object = json!({
            "user_id": self.user_id,
            "usage": [usage],
            "keys": {format!("ed25519:{public_key}"): public_key}
        });
        Ok(serde_json::from_value(object)?)
    }

    /// Sign `object` in place with the key of `usage`.
    pub fn sign(&self, object: &mut Value, usage: KeyUsage) -> Result<(), FixtureError> {
        let key_id = self.key_id(usage)?;
        Ok(SignatureEngine::sign_value(object, &self.user_id, &key_id, self.signing_key(usage))?)
    }

    /// All three cross-signing keys, dependents signed by the master.
    pub fn signing_keys_upload(&self) -> Result<UploadSigningKeysRequest, FixtureError> {
        Ok(UploadSigningKeysRequest {
            master_key: Some(self.cross_signing_key(KeyUsage::Master)?),
            self_signing_key: Some(self.signed_dependent(KeyUsage::SelfSigning)?),
            user_signing_key: Some(self.signed_dependent(KeyUsage::UserSigning)?),
        })
    }

    /// Device identity keys for `device_id`, signed by the device key.
    ///
    /// Returns the keys and the device's own signing key.
    pub fn device_keys(&mut self, device_id: &str) -> Result<(DeviceKeys, SigningKey), FixtureError> {
        let device_key = SigningKey::from_bytes(&self.rng.r#gen());
        let curve_key: [u8; 32] = self.rng.r#gen();

        let mut object = json!({
            "user_id": self.user_id,
            "device_id": device_id,
            "algorithms": DEVICE_ALGORITHMS,
            "keys": {
                format!("ed25519:{device_id}"): public_key_base64(&device_key),
                format!("curve25519:{device_id}"): encode_base64(curve_key)
            }
        });
        let key_id = KeyId::new("ed25519", device_id)?;
        SignatureEngine::sign_value(&mut object, &self.user_id, &key_id, &device_key)?;

        Ok((serde_json::from_value(object)?, device_key))
    }

    /// Upload request with device keys and `count` one-time keys.
    pub fn keys_upload(&mut self, device_id: &str, count: usize) -> Result<UploadKeysRequest, FixtureError> {
        let (device_keys, _) = self.device_keys(device_id)?;
        let one_time_keys = self.one_time_keys(count)?;
        Ok(UploadKeysRequest { device_keys: Some(device_keys), one_time_keys: Some(one_time_keys) })
    }

    /// `count` fresh one-time keys with sequential key ids.
    pub fn one_time_keys(&mut self, count: usize) -> Result<BTreeMap<KeyId, OneTimeKey>, FixtureError> {
        (0..count)
            .map(|i| -> Result<(KeyId, OneTimeKey), FixtureError> {
                let key_id = KeyId::new(ONE_TIME_KEY_ALGORITHM, &format!("AAAA{i:06}"))?;
                let key: [u8; 32] = self.rng.r#gen();
                Ok((key_id, OneTimeKey::Bare(encode_base64(key))))
            })
            .collect()
    }

    fn signed_dependent(&self, usage: KeyUsage) -> Result<CrossSigningKey, FixtureError> {
        let mut object = serde_json::to_value(self.cross_signing_key(usage)?)?;
        self.sign(&mut object, KeyUsage::Master)?;
        Ok(serde_json::from_value(object)?)
    }
}

/// Sign `target`'s master key with `signer`'s user-signing key.
///
/// Returns the signed copy, ready for a signature upload.
pub fn sign_master_of(signer: &TestUser, target: &CrossSigningKey) -> Result<Value, FixtureError> {
    let mut object = serde_json::to_value(target)?;
    signer.sign(&mut object, KeyUsage::UserSigning)?;
    Ok(object)
}
