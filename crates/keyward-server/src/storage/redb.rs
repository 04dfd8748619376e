//! Key store persisted in a redb database file.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait method runs in exactly one transaction, so a failed call leaves the
//! database untouched.
//!
//! # Key layout
//!
//! Composite keys are built from length-prefixed parts (4-byte big-endian
//! length, then the bytes) followed by one raw tail part. Length prefixes make
//! every prefix unambiguous, so all rows of a user or device can be found with
//! a range scan; the raw tail keeps rows under one prefix ordered by the
//! tail's bytes, which for one-time keys is key id order.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use keyward_proto::{DeviceId, DeviceKeys, KeyId, KeyUsage, OneTimeKey, SignatureSet, UserId};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    CrossSigningUpdate, DeviceRecord, KeyStore, MasterChange, StorageError, StoredCrossSigningKey,
    device_keys_to_store, is_cross_signing_id, one_time_key_conflicts, plan_master_change,
    update_public_keys,
};

/// Table: device_keys
/// Key: [user][device raw]
/// Value: CBOR-encoded DeviceKeys
const DEVICE_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("device_keys");

/// Table: one_time_keys
/// Key: [user][device][key id raw]
/// Value: CBOR-encoded OneTimeKey
const ONE_TIME_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("one_time_keys");

/// Table: cross_signing_keys
/// Key: [user][usage raw]
/// Value: CBOR-encoded StoredCrossSigningKey
const CROSS_SIGNING_KEYS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("cross_signing_keys");

/// Table: devices
/// Key: [user][device raw]
/// Value: CBOR-encoded DeviceRecord
const DEVICES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("devices");

/// Key store that survives restarts.
///
/// Clones share the database handle; redb serializes writers.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open the database at `path`, creating the file and tables if missing.
    ///
    /// Creates tables if they don't exist (DEVICE_KEYS, ONE_TIME_KEYS,
    /// CROSS_SIGNING_KEYS, DEVICES).
    ///
    /// # Errors
    ///
    /// `StorageError::Io` if the file cannot be opened or the tables created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(DEVICE_KEYS).map_err(io_error)?;
            let _ = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;
            let _ = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;
            let _ = txn.open_table(DEVICES).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn io_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

impl KeyStore for RedbStorage {
    fn store_device_keys(&self, user: &UserId, keys: &DeviceKeys) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        {
            let cross_signing = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;
            if is_cross_signing_key(&cross_signing, user, &keys.device_id)? {
                return Err(StorageError::IdCollision { id: keys.device_id.clone() });
            }

            let mut table = txn.open_table(DEVICE_KEYS).map_err(io_error)?;

            let key = encode_key(&[user.as_str()], &keys.device_id);
            let stored: Option<DeviceKeys> = get_cbor(&table, &key)?;
            put_cbor(&mut table, &key, &device_keys_to_store(stored.as_ref(), keys))?;
        }

        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn load_device_keys(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceKeys>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(DEVICE_KEYS).map_err(io_error)?;

        let prefix = encode_prefix(&[user.as_str()]);
        scan_prefix(&table, &prefix)?
            .into_iter()
            .map(|(tail, value)| Ok((tail_string(&tail)?, from_cbor(&value)?)))
            .collect()
    }

    fn load_device_key(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<Option<DeviceKeys>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(DEVICE_KEYS).map_err(io_error)?;

        let key = encode_key(&[user.as_str()], device_id);
        match table.get(key.as_slice()).map_err(io_error)? {
            Some(value) => Ok(Some(from_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn add_device_signatures(
        &self,
        user: &UserId,
        device_id: &str,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        {
            let mut table = txn.open_table(DEVICE_KEYS).map_err(io_error)?;

            let key = encode_key(&[user.as_str()], device_id);
            let Some(mut keys) = get_cbor::<DeviceKeys>(&table, &key)? else {
                return Ok(false);
            };

            keys.signatures.extend_absent(signatures);
            put_cbor(&mut table, &key, &keys)?;
        }

        txn.commit().map_err(io_error)?;

        Ok(true)
    }

    fn add_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
        keys: &[(KeyId, OneTimeKey)],
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        {
            let mut table = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;

            // Check the whole batch before writing anything. Returning before
            // commit aborts the transaction.
            let mut new_keys = Vec::with_capacity(keys.len());
            for (key_id, key) in keys {
                let row_key = encode_key(&[user.as_str(), device_id], key_id.as_str());
                match table.get(row_key.as_slice()).map_err(io_error)? {
                    Some(existing) => {
                        let existing: OneTimeKey = from_cbor(existing.value())?;
                        if one_time_key_conflicts(&existing, key) {
                            return Err(StorageError::Conflict { key_id: key_id.clone() });
                        }
                    },
                    None => new_keys.push((row_key, to_cbor(key)?)),
                }
            }

            for (row_key, bytes) in new_keys {
                table.insert(row_key.as_slice(), bytes.as_slice()).map_err(io_error)?;
            }
        }

        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn count_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;

        let prefix = encode_prefix(&[user.as_str(), device_id]);
        let mut counts = BTreeMap::new();
        for (tail, _) in scan_prefix(&table, &prefix)? {
            let key_id = KeyId::parse(tail_string(&tail)?)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            *counts.entry(key_id.algorithm().to_string()).or_insert(0) += 1;
        }

        Ok(counts)
    }

    fn take_one_time_key(
        &self,
        user: &UserId,
        device_id: &str,
        algorithm: &str,
    ) -> Result<Option<(KeyId, OneTimeKey)>, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        let taken = {
            let mut table = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;

            // Key ids of one algorithm share the `algorithm:` tail prefix and
            // sort by key id within it
            let mut prefix = encode_prefix(&[user.as_str(), device_id]);
            prefix.extend_from_slice(algorithm.as_bytes());
            prefix.push(b':');

            let first = scan_prefix(&table, &prefix)?.into_iter().next();
            match first {
                Some((tail, value)) => {
                    let key_id = KeyId::parse(format!("{algorithm}:{}", tail_string(&tail)?))
                        .map_err(|e| StorageError::Serialization(e.to_string()))?;
                    let key: OneTimeKey = from_cbor(&value)?;

                    let row_key = encode_key(&[user.as_str(), device_id], key_id.as_str());
                    table.remove(row_key.as_slice()).map_err(io_error)?;
                    Some((key_id, key))
                },
                None => None,
            }
        };

        txn.commit().map_err(io_error)?;

        Ok(taken)
    }

    fn load_cross_signing_key(
        &self,
        user: &UserId,
        usage: KeyUsage,
    ) -> Result<Option<StoredCrossSigningKey>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;

        let key = encode_key(&[user.as_str()], usage.as_str());
        match table.get(key.as_slice()).map_err(io_error)? {
            Some(value) => Ok(Some(from_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn apply_cross_signing_update(
        &self,
        user: &UserId,
        update: &CrossSigningUpdate,
    ) -> Result<MasterChange, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        let change = {
            let devices = txn.open_table(DEVICES).map_err(io_error)?;
            let device_keys = txn.open_table(DEVICE_KEYS).map_err(io_error)?;
            for id in update_public_keys(update) {
                let key = encode_key(&[user.as_str()], id);
                if devices.get(key.as_slice()).map_err(io_error)?.is_some()
                    || device_keys.get(key.as_slice()).map_err(io_error)?.is_some()
                {
                    return Err(StorageError::IdCollision { id: id.to_string() });
                }
            }

            let mut table = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;

            let master_key = encode_key(&[user.as_str()], KeyUsage::Master.as_str());
            let stored: Option<StoredCrossSigningKey> = get_cbor(&table, &master_key)?;

            let (master_row, change, generation) = plan_master_change(stored.as_ref(), update)?;

            if let MasterChange::Replaced { .. } = change {
                for usage in [KeyUsage::SelfSigning, KeyUsage::UserSigning] {
                    let key = encode_key(&[user.as_str()], usage.as_str());
                    table.remove(key.as_slice()).map_err(io_error)?;
                }
            }

            if let Some(row) = master_row {
                put_cbor(&mut table, &master_key, &row)?;
            }

            let dependents = [
                (KeyUsage::SelfSigning, &update.self_signing),
                (KeyUsage::UserSigning, &update.user_signing),
            ];
            for (usage, key) in dependents {
                if let Some(key) = key {
                    let row = StoredCrossSigningKey { key: key.clone(), generation };
                    put_cbor(&mut table, &encode_key(&[user.as_str()], usage.as_str()), &row)?;
                }
            }

            change
        };

        txn.commit().map_err(io_error)?;

        Ok(change)
    }

    fn add_cross_signing_signatures(
        &self,
        user: &UserId,
        usage: KeyUsage,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        {
            let mut table = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;

            let key = encode_key(&[user.as_str()], usage.as_str());
            let Some(mut row) = get_cbor::<StoredCrossSigningKey>(&table, &key)? else {
                return Ok(false);
            };

            row.key.signatures.extend_absent(signatures);
            put_cbor(&mut table, &key, &row)?;
        }

        txn.commit().map_err(io_error)?;

        Ok(true)
    }

    fn register_device(
        &self,
        user: &UserId,
        device_id: &str,
        display_name: Option<&str>,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        {
            let mut table = txn.open_table(DEVICES).map_err(io_error)?;

            let key = encode_key(&[user.as_str()], device_id);

            if table.get(key.as_slice()).map_err(io_error)?.is_some() {
                return Ok(false); // Already registered, don't overwrite
            }

            let cross_signing = txn.open_table(CROSS_SIGNING_KEYS).map_err(io_error)?;
            if is_cross_signing_key(&cross_signing, user, device_id)? {
                return Err(StorageError::IdCollision { id: device_id.to_string() });
            }

            let record = DeviceRecord { display_name: display_name.map(str::to_string) };
            put_cbor(&mut table, &key, &record)?;
        }

        txn.commit().map_err(io_error)?;

        Ok(true)
    }

    fn load_devices(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(DEVICES).map_err(io_error)?;

        let prefix = encode_prefix(&[user.as_str()]);
        scan_prefix(&table, &prefix)?
            .into_iter()
            .map(|(tail, value)| Ok((tail_string(&tail)?, from_cbor(&value)?)))
            .collect()
    }

    fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;

        let mut removed = false;
        {
            let key = encode_key(&[user.as_str()], device_id);

            for definition in [DEVICES, DEVICE_KEYS] {
                let mut table = txn.open_table(definition).map_err(io_error)?;
                removed |= table
                    .remove(key.as_slice())
                    .map_err(io_error)?
                    .is_some();
            }

            let mut table = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;
            let prefix = encode_prefix(&[user.as_str(), device_id]);
            for (tail, _) in scan_prefix(&table, &prefix)? {
                let mut row_key = prefix.clone();
                row_key.extend_from_slice(&tail);
                table.remove(row_key.as_slice()).map_err(io_error)?;
                removed = true;
            }
        }

        txn.commit().map_err(io_error)?;

        Ok(removed)
    }
}

/// Encode length-prefixed key parts.
///
/// Format: for each part `[len: 4 bytes BE][bytes]`
fn encode_prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| 4 + p.len()).sum::<usize>() + 32);
    for part in parts {
        key.extend_from_slice(&(part.len() as u32).to_be_bytes());
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Encode a full key: length-prefixed parts followed by a raw tail.
fn encode_key(parts: &[&str], tail: &str) -> Vec<u8> {
    let mut key = encode_prefix(parts);
    key.extend_from_slice(tail.as_bytes());
    key
}

fn tail_string(tail: &[u8]) -> Result<String, StorageError> {
    String::from_utf8(tail.to_vec()).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// All rows whose key starts with `prefix`, as `(tail, value)` pairs in key
/// order.
fn scan_prefix<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
    let results = table.range(prefix..).map_err(io_error)?;

    let mut rows = Vec::new();
    for result in results {
        let (key, value) = result.map_err(io_error)?;
        let key = key.value();

        if !key.starts_with(prefix) {
            break;
        }

        rows.push((key[prefix.len()..].to_vec(), value.value().to_vec()));
    }

    Ok(rows)
}

/// Decode the row stored under `key`, if any.
///
/// The row is decoded before returning, so the table is free to be written
/// again afterwards.
fn get_cbor<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    match table.get(key).map_err(io_error)? {
        Some(value) => Ok(Some(from_cbor(value.value())?)),
        None => Ok(None),
    }
}

/// Whether `id` is the public key of one of the user's cross-signing keys.
fn is_cross_signing_key(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    user: &UserId,
    id: &str,
) -> Result<bool, StorageError> {
    let mut rows = Vec::with_capacity(KeyUsage::ALL.len());
    for usage in KeyUsage::ALL {
        let key = encode_key(&[user.as_str()], usage.as_str());
        rows.extend(get_cbor::<StoredCrossSigningKey>(table, &key)?);
    }
    Ok(is_cross_signing_id(&rows, id))
}

fn put_cbor<T: Serialize>(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    key: &[u8],
    value: &T,
) -> Result<(), StorageError> {
    let bytes = to_cbor(value)?;
    table.insert(key, bytes.as_slice()).map_err(io_error)?;
    Ok(())
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_do_not_collide() {
        // "@a:b" + "c" must not look like a prefix of "@a:bc"
        let short = encode_key(&["@a:b", "c"], "k");
        let long = encode_prefix(&["@a:bc"]);
        assert!(!short.starts_with(&long));
        assert!(!long.starts_with(&encode_prefix(&["@a:b"])));
    }

    #[test]
    fn tails_sort_by_raw_bytes() {
        let a = encode_key(&["@a:b", "dev"], "alg:AAAA");
        let b = encode_key(&["@a:b", "dev"], "alg:AAAB");
        let c = encode_key(&["@a:b", "dev"], "alg:B");
        assert!(a < b && b < c);
    }
}
