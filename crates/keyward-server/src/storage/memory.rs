//! Key store held in process memory.

#![allow(clippy::disallowed_types, reason = "lock is never held across an await")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use keyward_proto::{DeviceId, DeviceKeys, KeyId, KeyUsage, OneTimeKey, SignatureSet, UserId};

use super::{
    CrossSigningUpdate, DeviceRecord, KeyStore, MasterChange, StorageError, StoredCrossSigningKey,
    device_keys_to_store, is_cross_signing_id, one_time_key_conflicts, plan_master_change,
    update_public_keys,
};

type DeviceKey = (UserId, DeviceId);

/// Key store for tests, simulated remote servers and the admin tool's dry runs.
///
/// Every trait method takes the one lock for its whole body, which is what
/// makes the multi-row methods atomic. A poisoned lock panics.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    /// Identity keys per device
    device_keys: BTreeMap<DeviceKey, DeviceKeys>,

    /// Unclaimed one-time keys per device, ordered by key id
    one_time_keys: BTreeMap<DeviceKey, BTreeMap<KeyId, OneTimeKey>>,

    /// Cross-signing keys per user and usage
    cross_signing: BTreeMap<(UserId, KeyUsage), StoredCrossSigningKey>,

    /// Device registry
    devices: BTreeMap<DeviceKey, DeviceRecord>,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Tables::default())) }
    }

    /// Unclaimed one-time keys over every device.
    pub fn total_one_time_keys(&self) -> usize {
        self.tables().one_time_keys.values().map(BTreeMap::len).sum()
    }

    #[allow(clippy::expect_used)]
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().expect("memory store poisoned")
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn device_key(user: &UserId, device_id: &str) -> DeviceKey {
    (user.clone(), device_id.to_string())
}

impl Tables {
    fn is_cross_signing_key(&self, user: &UserId, id: &str) -> bool {
        let rows =
            KeyUsage::ALL.iter().filter_map(|usage| self.cross_signing.get(&(user.clone(), *usage)));
        is_cross_signing_id(rows, id)
    }

    fn has_device(&self, user: &UserId, device_id: &str) -> bool {
        let key = device_key(user, device_id);
        self.devices.contains_key(&key) || self.device_keys.contains_key(&key)
    }
}

impl KeyStore for MemoryStorage {
    fn store_device_keys(&self, user: &UserId, keys: &DeviceKeys) -> Result<(), StorageError> {
        let mut tables = self.tables();

        if tables.is_cross_signing_key(user, &keys.device_id) {
            return Err(StorageError::IdCollision { id: keys.device_id.clone() });
        }

        let key = device_key(user, &keys.device_id);
        let row = device_keys_to_store(tables.device_keys.get(&key), keys);
        tables.device_keys.insert(key, row);
        Ok(())
    }

    fn load_device_keys(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceKeys>, StorageError> {
        let tables = self.tables();

        Ok(tables
            .device_keys
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|((_, device_id), keys)| (device_id.clone(), keys.clone()))
            .collect())
    }

    fn load_device_key(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<Option<DeviceKeys>, StorageError> {
        let tables = self.tables();
        Ok(tables.device_keys.get(&device_key(user, device_id)).cloned())
    }

    fn add_device_signatures(
        &self,
        user: &UserId,
        device_id: &str,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables();

        match tables.device_keys.get_mut(&device_key(user, device_id)) {
            Some(keys) => {
                keys.signatures.extend_absent(signatures);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn add_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
        keys: &[(KeyId, OneTimeKey)],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let stored = tables.one_time_keys.entry(device_key(user, device_id)).or_default();

        // Check the whole batch before writing anything
        for (key_id, key) in keys {
            if stored.get(key_id).is_some_and(|existing| one_time_key_conflicts(existing, key)) {
                return Err(StorageError::Conflict { key_id: key_id.clone() });
            }
        }

        for (key_id, key) in keys {
            stored.entry(key_id.clone()).or_insert_with(|| key.clone());
        }

        Ok(())
    }

    fn count_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        let tables = self.tables();

        let mut counts = BTreeMap::new();
        if let Some(stored) = tables.one_time_keys.get(&device_key(user, device_id)) {
            for key_id in stored.keys() {
                *counts.entry(key_id.algorithm().to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn take_one_time_key(
        &self,
        user: &UserId,
        device_id: &str,
        algorithm: &str,
    ) -> Result<Option<(KeyId, OneTimeKey)>, StorageError> {
        let mut tables = self.tables();

        let Some(stored) = tables.one_time_keys.get_mut(&device_key(user, device_id)) else {
            return Ok(None);
        };

        let Some(key_id) = stored.keys().find(|id| id.algorithm() == algorithm).cloned() else {
            return Ok(None);
        };

        Ok(stored.remove(&key_id).map(|key| (key_id, key)))
    }

    fn load_cross_signing_key(
        &self,
        user: &UserId,
        usage: KeyUsage,
    ) -> Result<Option<StoredCrossSigningKey>, StorageError> {
        let tables = self.tables();
        Ok(tables.cross_signing.get(&(user.clone(), usage)).cloned())
    }

    fn apply_cross_signing_update(
        &self,
        user: &UserId,
        update: &CrossSigningUpdate,
    ) -> Result<MasterChange, StorageError> {
        let mut tables = self.tables();

        if let Some(id) = update_public_keys(update).find(|id| tables.has_device(user, id)) {
            return Err(StorageError::IdCollision { id: id.to_string() });
        }

        let stored = tables.cross_signing.get(&(user.clone(), KeyUsage::Master));
        let (master_row, change, generation) = plan_master_change(stored, update)?;

        if let MasterChange::Replaced { .. } = change {
            tables.cross_signing.remove(&(user.clone(), KeyUsage::SelfSigning));
            tables.cross_signing.remove(&(user.clone(), KeyUsage::UserSigning));
        }

        if let Some(row) = master_row {
            tables.cross_signing.insert((user.clone(), KeyUsage::Master), row);
        }

        let dependents = [
            (KeyUsage::SelfSigning, &update.self_signing),
            (KeyUsage::UserSigning, &update.user_signing),
        ];
        for (usage, key) in dependents {
            if let Some(key) = key {
                let row = StoredCrossSigningKey { key: key.clone(), generation };
                tables.cross_signing.insert((user.clone(), usage), row);
            }
        }

        Ok(change)
    }

    fn add_cross_signing_signatures(
        &self,
        user: &UserId,
        usage: KeyUsage,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables();

        match tables.cross_signing.get_mut(&(user.clone(), usage)) {
            Some(row) => {
                row.key.signatures.extend_absent(signatures);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn register_device(
        &self,
        user: &UserId,
        device_id: &str,
        display_name: Option<&str>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables();

        let key = device_key(user, device_id);
        if tables.devices.contains_key(&key) {
            return Ok(false);
        }
        if tables.is_cross_signing_key(user, device_id) {
            return Err(StorageError::IdCollision { id: device_id.to_string() });
        }

        tables.devices.insert(key, DeviceRecord { display_name: display_name.map(str::to_string) });
        Ok(true)
    }

    fn load_devices(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceRecord>, StorageError> {
        let tables = self.tables();

        Ok(tables
            .devices
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|((_, device_id), record)| (device_id.clone(), record.clone()))
            .collect())
    }

    fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, StorageError> {
        let mut tables = self.tables();

        let key = device_key(user, device_id);
        let had_record = tables.devices.remove(&key).is_some();
        let had_keys = tables.device_keys.remove(&key).is_some();
        let had_one_time_keys = tables.one_time_keys.remove(&key).is_some_and(|keys| !keys.is_empty());

        Ok(had_record || had_keys || had_one_time_keys)
    }
}
