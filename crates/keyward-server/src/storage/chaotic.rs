//! Fault-injecting key store.
//!
//! Wraps another [`KeyStore`] and fails a seeded fraction of calls with
//! [`StorageError::Io`] before they reach it. Chaos tests use it to check
//! that an upload which hits a failure leaves no partial state behind.

#![allow(clippy::disallowed_types, reason = "shared seeded RNG")]

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use keyward_proto::{DeviceId, DeviceKeys, KeyId, KeyUsage, OneTimeKey, SignatureSet, UserId};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    CrossSigningUpdate, DeviceRecord, KeyStore, MasterChange, StorageError, StoredCrossSigningKey,
};

const DEFAULT_SEED: u64 = 0x6b65_7977_6172_6400;

/// Key store that fails calls at random.
///
/// Clones share the RNG and the call counter, so a clone handed to a manager
/// draws from the same fault sequence as the test's handle.
#[derive(Clone)]
pub struct ChaoticStorage<S: KeyStore> {
    inner: S,
    failure_rate: f64,
    rng: Arc<Mutex<StdRng>>,
    calls: Arc<AtomicUsize>,
}

impl<S: KeyStore> ChaoticStorage<S> {
    /// Wrap `inner`, failing calls with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// If `failure_rate` is outside `0.0..=1.0`.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Like [`Self::new`], with the fault sequence fixed by `seed`.
    ///
    /// # Panics
    ///
    /// If `failure_rate` is outside `0.0..=1.0`.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!((0.0..=1.0).contains(&failure_rate), "invalid failure rate {failure_rate}");

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The wrapped store, for checking what actually got written.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls made through this store, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn inject(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::expect_used)]
        let fail = self.rng.lock().expect("chaos rng poisoned").gen_bool(self.failure_rate);

        if fail { Err(StorageError::Io("injected fault".to_string())) } else { Ok(()) }
    }
}

impl<S: KeyStore> KeyStore for ChaoticStorage<S> {
    fn store_device_keys(&self, user: &UserId, keys: &DeviceKeys) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_device_keys(user, keys)
    }

    fn load_device_keys(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceKeys>, StorageError> {
        self.inject()?;
        self.inner.load_device_keys(user)
    }

    fn load_device_key(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<Option<DeviceKeys>, StorageError> {
        self.inject()?;
        self.inner.load_device_key(user, device_id)
    }

    fn add_device_signatures(
        &self,
        user: &UserId,
        device_id: &str,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        self.inject()?;
        self.inner.add_device_signatures(user, device_id, signatures)
    }

    fn add_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
        keys: &[(KeyId, OneTimeKey)],
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.add_one_time_keys(user, device_id, keys)
    }

    fn count_one_time_keys(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        self.inject()?;
        self.inner.count_one_time_keys(user, device_id)
    }

    fn take_one_time_key(
        &self,
        user: &UserId,
        device_id: &str,
        algorithm: &str,
    ) -> Result<Option<(KeyId, OneTimeKey)>, StorageError> {
        self.inject()?;
        self.inner.take_one_time_key(user, device_id, algorithm)
    }

    fn load_cross_signing_key(
        &self,
        user: &UserId,
        usage: KeyUsage,
    ) -> Result<Option<StoredCrossSigningKey>, StorageError> {
        self.inject()?;
        self.inner.load_cross_signing_key(user, usage)
    }

    fn apply_cross_signing_update(
        &self,
        user: &UserId,
        update: &CrossSigningUpdate,
    ) -> Result<MasterChange, StorageError> {
        self.inject()?;
        self.inner.apply_cross_signing_update(user, update)
    }

    fn add_cross_signing_signatures(
        &self,
        user: &UserId,
        usage: KeyUsage,
        signatures: &SignatureSet,
    ) -> Result<bool, StorageError> {
        self.inject()?;
        self.inner.add_cross_signing_signatures(user, usage, signatures)
    }

    fn register_device(
        &self,
        user: &UserId,
        device_id: &str,
        display_name: Option<&str>,
    ) -> Result<bool, StorageError> {
        self.inject()?;
        self.inner.register_device(user, device_id, display_name)
    }

    fn load_devices(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceRecord>, StorageError> {
        self.inject()?;
        self.inner.load_devices(user)
    }

    fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, StorageError> {
        self.inject()?;
        self.inner.delete_device(user, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn boris() -> UserId {
        UserId::parse("@boris:hs").unwrap()
    }

    fn one_time_keys(n: usize) -> Vec<(KeyId, OneTimeKey)> {
        (0..n)
            .map(|i| {
                (KeyId::new("alg", &format!("k{i}")).unwrap(), OneTimeKey::Bare(format!("key{i}")))
            })
            .collect()
    }

    #[test]
    fn never_fails_at_rate_zero() {
        let store = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for i in 0..100 {
            store.register_device(&boris(), &format!("DEV{i}"), None).unwrap();
        }

        assert_eq!(store.load_devices(&boris()).unwrap().len(), 100);
        assert_eq!(store.operation_count(), 101);
    }

    #[test]
    fn rate_one_never_reaches_inner_store() {
        let store = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(store.add_one_time_keys(&boris(), "dev", &one_time_keys(3)).is_err());
        assert!(store.count_one_time_keys(&boris(), "dev").is_err());
        assert!(store.take_one_time_key(&boris(), "dev", "alg").is_err());

        assert_eq!(store.inner().total_one_time_keys(), 0);
        assert_eq!(store.operation_count(), 3);
    }

    #[test]
    fn seed_fixes_fault_sequence() {
        let first = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);
        let second = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);

        let faults = |store: &ChaoticStorage<MemoryStorage>| -> Vec<bool> {
            (0..100)
                .map(|i| store.register_device(&boris(), &format!("DEV{i}"), None).is_err())
                .collect()
        };

        let sequence = faults(&first);
        assert_eq!(sequence, faults(&second));
        assert!(sequence.contains(&true) && sequence.contains(&false));
    }

    #[test]
    #[should_panic(expected = "invalid failure rate")]
    fn rate_above_one_panics() {
        let _store = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
