//! Device identity keys and one-time keys.
//!
//! Device identity keys are replaced wholesale on every upload, except for
//! signatures that signature uploads added to the stored copy. One-time keys
//! are immutable once stored: re-uploading the same key material is accepted
//! as a no-op (signatures may differ), anything else fails the whole upload.

use std::collections::BTreeMap;

use keyward_proto::{
    DeviceId, DeviceKeys, KeyId, OneTimeKey, UploadKeysRequest, UploadKeysResponse, UserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{cross_signing::CrossSigningManager, error::KeyError, storage::KeyStore};

/// Device keys of several users: user → device → keys.
pub type UserDeviceKeys = BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>;

/// Stores and serves per-device keys.
#[derive(Clone)]
pub struct DeviceKeyManager<S: KeyStore> {
    storage: S,
    cross_signing: CrossSigningManager<S>,
    server_name: String,
}

impl<S: KeyStore> DeviceKeyManager<S> {
    /// Create a manager for users of `server_name`.
    pub fn new(storage: S, server_name: impl Into<String>) -> Self {
        Self {
            cross_signing: CrossSigningManager::new(storage.clone()),
            storage,
            server_name: server_name.into(),
        }
    }

    /// Upload device identity keys and/or one-time keys for a device.
    ///
    /// One-time keys are applied first, in one atomic storage call, so a
    /// conflict leaves the stored device keys untouched as well.
    ///
    /// # Errors
    ///
    /// - `Validation` if the device keys name another user or device, or the
    ///   device id is one of the user's cross-signing keys
    /// - `Conflict` if a one-time key would change
    pub fn upload_keys(
        &self,
        user: &UserId,
        device_id: &str,
        request: &UploadKeysRequest,
    ) -> Result<UploadKeysResponse, KeyError> {
        if let Some(keys) = &request.device_keys {
            self.validate_device_keys(user, device_id, keys)?;
        }

        if let Some(one_time_keys) = request.one_time_keys.as_ref().filter(|keys| !keys.is_empty()) {
            let batch: Vec<(KeyId, OneTimeKey)> =
                one_time_keys.iter().map(|(id, key)| (id.clone(), key.clone())).collect();

            self.storage.add_one_time_keys(user, device_id, &batch).map_err(|e| {
                warn!(%user, device_id, error = %e, "one-time key upload refused");
                KeyError::from(e)
            })?;

            debug!(%user, device_id, count = batch.len(), "stored one-time keys");
        }

        if let Some(keys) = &request.device_keys {
            let mut keys = keys.clone();
            keys.unsigned = None;
            // Cross-signing signatures only enter through signature uploads,
            // where they are verified
            keys.signatures =
                keys.signatures.filtered(|signer, key_id| keys.is_device_key(signer, key_id));
            self.storage.store_device_keys(user, &keys)?;

            info!(%user, device_id, "stored device keys");
        }

        Ok(UploadKeysResponse { one_time_key_counts: self.one_time_key_counts(user, device_id)? })
    }

    /// Unclaimed one-time keys of a device, per algorithm.
    pub fn one_time_key_counts(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, KeyError> {
        Ok(self.storage.count_one_time_keys(user, device_id)?)
    }

    /// Device keys of local users.
    ///
    /// `None` or an empty list selects every device of the user. Every
    /// requested local user appears in the result, possibly with no devices.
    /// Users of other servers are skipped. Cross-signing keys are never
    /// returned as devices.
    pub fn query_local_devices(
        &self,
        query: &BTreeMap<UserId, Option<Vec<DeviceId>>>,
    ) -> Result<UserDeviceKeys, KeyError> {
        let mut result = UserDeviceKeys::new();

        for (user, device_ids) in query {
            if user.server_name() != self.server_name {
                warn!(%user, "skipping device query for remote user");
                continue;
            }

            let mut devices = self.storage.load_device_keys(user)?;

            if let Some(wanted) = device_ids.as_ref().filter(|ids| !ids.is_empty()) {
                devices.retain(|device_id, _| wanted.contains(device_id));
            }

            let hidden = self.cross_signing.cross_signing_key_ids(user)?;
            devices.retain(|device_id, _| !hidden.contains(device_id));

            let records = self.storage.load_devices(user)?;
            for (device_id, keys) in &mut devices {
                let mut unsigned = keys.unsigned.take().unwrap_or_default();
                if let Some(name) = records.get(device_id).and_then(|r| r.display_name.as_ref()) {
                    unsigned.insert("device_display_name".to_string(), Value::String(name.clone()));
                }
                keys.unsigned = Some(unsigned);
            }

            debug!(%user, devices = devices.len(), "answered local device query");
            result.insert(user.clone(), devices);
        }

        Ok(result)
    }

    fn validate_device_keys(
        &self,
        user: &UserId,
        device_id: &str,
        keys: &DeviceKeys,
    ) -> Result<(), KeyError> {
        if keys.user_id != *user {
            return Err(KeyError::Validation(format!(
                "device keys belong to {}, not {user}",
                keys.user_id
            )));
        }

        if keys.device_id != device_id {
            return Err(KeyError::Validation(format!(
                "device keys are for device {}, not {device_id}",
                keys.device_id
            )));
        }

        if self.cross_signing.is_cross_signing_key_id(user, device_id)? {
            return Err(KeyError::Validation(format!(
                "device id {device_id} is a cross-signing key of {user}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    fn user() -> UserId {
        UserId::parse("@boris:hs").unwrap()
    }

    fn manager() -> DeviceKeyManager<MemoryStorage> {
        DeviceKeyManager::new(MemoryStorage::new(), "hs")
    }

    fn device_keys(device_id: &str) -> DeviceKeys {
        serde_json::from_value(json!({
            "user_id": "@boris:hs",
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
            "keys": {format!("ed25519:{device_id}"): "key"}
        }))
        .unwrap()
    }

    fn upload_device(manager: &DeviceKeyManager<MemoryStorage>, keys: DeviceKeys) {
        let device_id = keys.device_id.clone();
        let request = UploadKeysRequest { device_keys: Some(keys), one_time_keys: None };
        manager.upload_keys(&user(), &device_id, &request).unwrap();
    }

    #[test]
    fn device_keys_must_match_caller() {
        let manager = manager();

        let request = UploadKeysRequest { device_keys: Some(device_keys("abc")), one_time_keys: None };
        let result = manager.upload_keys(&user(), "def", &request);
        assert!(matches!(result, Err(KeyError::Validation(_))));

        let other = UserId::parse("@alice:hs").unwrap();
        let result = manager.upload_keys(&other, "abc", &request);
        assert!(matches!(result, Err(KeyError::Validation(_))));
    }

    #[test]
    fn conflict_leaves_device_keys_untouched() {
        let manager = manager();
        let one_time_keys = |key: &str| {
            Some(BTreeMap::from([(KeyId::parse("alg1:k1").unwrap(), OneTimeKey::Bare(key.into()))]))
        };

        manager
            .upload_keys(&user(), "abc", &UploadKeysRequest {
                device_keys: Some(device_keys("abc")),
                one_time_keys: one_time_keys("key1"),
            })
            .unwrap();

        let mut replacement = device_keys("abc");
        replacement.algorithms = vec!["changed".to_string()];
        let result = manager.upload_keys(&user(), "abc", &UploadKeysRequest {
            device_keys: Some(replacement),
            one_time_keys: one_time_keys("key2"),
        });

        assert!(matches!(result, Err(KeyError::Conflict(_))));
        let stored = manager.storage.load_device_key(&user(), "abc").unwrap().unwrap();
        assert_eq!(stored.algorithms, vec!["m.olm.v1.curve25519-aes-sha2".to_string()]);
    }

    #[test]
    fn upload_keeps_only_the_devices_own_signatures() {
        let manager = manager();

        let mut keys = device_keys("abc");
        keys.signatures = serde_json::from_value(json!({
            "@boris:hs": {"ed25519:abc": "own", "ed25519:SSK": "unverified"},
            "@alice:hs": {"ed25519:USK": "unverified"}
        }))
        .unwrap();
        upload_device(&manager, keys);

        let stored = manager.storage.load_device_key(&user(), "abc").unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&stored.signatures).unwrap(),
            json!({"@boris:hs": {"ed25519:abc": "own"}})
        );
    }

    #[test]
    fn unsigned_is_stripped_on_upload_and_filled_on_query() {
        let manager = manager();
        manager.storage.register_device(&user(), "abc", Some("phone")).unwrap();

        let mut keys = device_keys("abc");
        keys.unsigned = Some(
            serde_json::from_value(json!({"device_display_name": "forged", "extra": 1})).unwrap(),
        );
        upload_device(&manager, keys);

        let stored = manager.storage.load_device_key(&user(), "abc").unwrap().unwrap();
        assert!(stored.unsigned.is_none());

        let result = manager.query_local_devices(&BTreeMap::from([(user(), None)])).unwrap();
        let unsigned = result[&user()]["abc"].unsigned.clone().unwrap();
        assert_eq!(unsigned.get("device_display_name"), Some(&json!("phone")));
        assert!(unsigned.get("extra").is_none());
    }

    #[test]
    fn query_selects_devices_and_skips_remote_users() {
        let manager = manager();
        upload_device(&manager, device_keys("abc"));
        upload_device(&manager, device_keys("def"));

        let remote = UserId::parse("@alice:elsewhere").unwrap();
        let query = BTreeMap::from([
            (user(), Some(vec!["def".to_string(), "missing".to_string()])),
            (remote.clone(), None),
        ]);

        let result = manager.query_local_devices(&query).unwrap();
        assert_eq!(result[&user()].keys().collect::<Vec<_>>(), vec!["def"]);
        assert!(!result.contains_key(&remote));

        let all = manager.query_local_devices(&BTreeMap::from([(user(), Some(vec![]))])).unwrap();
        assert_eq!(all[&user()].len(), 2);
    }
}
