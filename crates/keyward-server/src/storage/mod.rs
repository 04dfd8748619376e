//! Storage abstraction for key material
//!
//! Trait-based abstraction for persisting device keys, one-time keys,
//! cross-signing keys and device records. The trait is synchronous (no async):
//! every method is one atomic unit, so managers never need transactions of
//! their own.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::BTreeMap;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use keyward_proto::{
    CrossSigningKey, DeviceId, DeviceKeys, KeyId, KeyUsage, OneTimeKey, SignatureSet, UserId,
};
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// A cross-signing key together with the master generation it belongs to.
///
/// The master key's generation increases every time it is replaced by a key
/// with a different public key. Self-signing and user-signing keys record the
/// generation of the master that signed them; a row whose generation differs
/// from the live master's is stale and must not be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCrossSigningKey {
    /// The key object, including signatures added after upload
    pub key: CrossSigningKey,
    /// Master generation
    pub generation: u64,
}

/// Registry entry for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Human-readable name chosen at registration
    pub display_name: Option<String>,
}

/// Cross-signing keys to write in one atomic unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrossSigningUpdate {
    /// New master key
    pub master: Option<CrossSigningKey>,
    /// New self-signing key
    pub self_signing: Option<CrossSigningKey>,
    /// New user-signing key
    pub user_signing: Option<CrossSigningKey>,
    /// Master key id the dependent keys were verified against
    ///
    /// Only checked when dependents are written without a new master: the
    /// stored master must still have this id.
    pub verified_against: Option<KeyId>,
}

impl CrossSigningUpdate {
    /// Whether a self-signing or user-signing key is part of the update.
    pub fn has_dependents(&self) -> bool {
        self.self_signing.is_some() || self.user_signing.is_some()
    }
}

/// What [`KeyStore::apply_cross_signing_update`] did to the master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterChange {
    /// No master key in the update
    Unchanged,
    /// Same public key as the stored master; stored row left as is
    Kept,
    /// Different (or first) master key; dependents of the old one removed
    Replaced {
        /// Generation of the new master
        generation: u64,
    },
}

/// Storage abstraction for key material
///
/// Must be Clone (shared by every manager), Send + Sync (thread-safe), and
/// synchronous (no async methods). Implementations typically share internal
/// state via Arc, so clones access the same underlying storage.
///
/// # Atomicity
///
/// Each method is all-or-nothing. A failed call leaves no trace of its
/// writes.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Store a device's identity keys, replacing any stored copy.
    ///
    /// # Invariants
    ///
    /// - Signatures of the stored copy by keys other than the device's own
    ///   are carried over to the new copy
    /// - `IdCollision` if the device id is one of the user's cross-signing
    ///   public keys; nothing is written
    fn store_device_keys(&self, user: &UserId, keys: &DeviceKeys) -> Result<(), StorageError>;

    /// All stored device keys of a user, by device id.
    fn load_device_keys(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceKeys>, StorageError>;

    /// Stored identity keys of one device.
    fn load_device_key(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<Option<DeviceKeys>, StorageError>;

    /// Add signatures to a device's stored keys, keeping existing entries.
    ///
    /// Returns `false` if the device has no stored keys.
    fn add_device_signatures(
        &self,
        user: &UserId,
        device_id: &str,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError>;

    /// Insert a batch of one-time keys.
    ///
    /// # Invariants
    ///
    /// - Pre: none of `keys` conflicts with a stored key of the same id
    ///   (identical `key` material in the same shape is not a conflict)
    /// - Post: all new keys are stored; on `Conflict` nothing is written
    fn add_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
        keys: &[(KeyId, OneTimeKey)],
    ) -> Result<(), StorageError>;

    /// Unclaimed one-time keys of a device, counted per algorithm.
    fn count_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError>;

    /// Remove and return one one-time key of `algorithm`, lowest key id first.
    ///
    /// Returns `None` if the device has no key of that algorithm. A key is
    /// returned by at most one call.
    fn take_one_time_key(
        &self,
        user: &UserId,
        device_id: &str,
        algorithm: &str,
    ) -> Result<Option<(KeyId, OneTimeKey)>, StorageError>;

    /// Stored cross-signing key of a user, whatever its generation.
    fn load_cross_signing_key(
        &self,
        user: &UserId,
        usage: KeyUsage,
    ) -> Result<Option<StoredCrossSigningKey>, StorageError>;

    /// Write cross-signing keys in one atomic unit.
    ///
    /// # Invariants
    ///
    /// - A master with a different public key than the stored one gets the
    ///   next generation and removes the stored self-signing and
    ///   user-signing keys
    /// - Dependents are stored with the live master's generation
    /// - Dependents without a new master require the stored master to match
    ///   `verified_against`, otherwise `StaleMaster` and nothing is written
    /// - A key whose public key is a registered or key-bearing device id of
    ///   the user fails with `IdCollision` and nothing is written
    fn apply_cross_signing_update(
        &self,
        user: &UserId,
        update: &CrossSigningUpdate,
    ) -> Result<MasterChange, StorageError>;

    /// Add signatures to a stored cross-signing key, keeping existing entries.
    ///
    /// Returns `false` if no key with that usage is stored.
    fn add_cross_signing_signatures(
        &self,
        user: &UserId,
        usage: KeyUsage,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError>;

    /// Add a device to the registry.
    ///
    /// Idempotent: returns `false` without touching the existing record if
    /// the device is already registered. `IdCollision` if the device id is
    /// one of the user's cross-signing public keys.
    fn register_device(
        &self,
        user: &UserId,
        device_id: &str,
        display_name: Option<&str>,
    ) -> Result<bool, StorageError>;

    /// Registered devices of a user.
    fn load_devices(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceRecord>, StorageError>;

    /// Remove a device: registry record, identity keys and one-time keys.
    ///
    /// Returns `false` if none of them existed.
    fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, StorageError>;
}

/// Resolve the master step of a cross-signing update against the stored
/// master, shared by the backends.
///
/// Returns the master row to write (if any), the change and the generation
/// dependents must be stored with.
fn plan_master_change(
    stored: Option<&StoredCrossSigningKey>,
    update: &CrossSigningUpdate,
) -> Result<(Option<StoredCrossSigningKey>, MasterChange, u64), StorageError> {
    let stored_id = stored.and_then(|s| s.key.single_key()).map(|(id, _)| id.clone());

    let Some(master) = &update.master else {
        if update.has_dependents() && update.verified_against != stored_id {
            return Err(StorageError::StaleMaster {
                expected: update.verified_against.clone(),
                found: stored_id,
            });
        }
        let generation = stored.map_or(0, |s| s.generation);
        return Ok((None, MasterChange::Unchanged, generation));
    };

    match stored {
        Some(current) if current.key.public_key() == master.public_key() => {
            Ok((None, MasterChange::Kept, current.generation))
        },
        _ => {
            let generation = stored.map_or(1, |s| s.generation + 1);
            let row = StoredCrossSigningKey { key: master.clone(), generation };
            Ok((Some(row), MasterChange::Replaced { generation }, generation))
        },
    }
}

/// Public keys introduced by a cross-signing update.
fn update_public_keys(update: &CrossSigningUpdate) -> impl Iterator<Item = &str> {
    [&update.master, &update.self_signing, &update.user_signing]
        .into_iter()
        .flatten()
        .filter_map(CrossSigningKey::public_key)
}

/// Whether `device_id` is the public key of one of the stored rows.
fn is_cross_signing_id<'a>(
    rows: impl IntoIterator<Item = &'a StoredCrossSigningKey>,
    device_id: &str,
) -> bool {
    rows.into_iter().any(|row| row.key.public_key() == Some(device_id))
}

/// The copy of `uploaded` to store over `stored`.
///
/// Signatures by the device's own keys come from the upload alone; every
/// other stored signature was accepted by a signature upload and is kept.
fn device_keys_to_store(stored: Option<&DeviceKeys>, uploaded: &DeviceKeys) -> DeviceKeys {
    let mut keys = uploaded.clone();
    if let Some(stored) = stored {
        let accepted =
            stored.signatures.filtered(|signer, key_id| !stored.is_device_key(signer, key_id));
        keys.signatures.extend_absent(&accepted);
    }
    keys
}

/// Whether a stored one-time key conflicts with an uploaded one.
fn one_time_key_conflicts(stored: &OneTimeKey, uploaded: &OneTimeKey) -> bool {
    !stored.same_key(uploaded)
}
