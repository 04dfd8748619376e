//! Device registry.
//!
//! Devices are registered when a user logs in, before any keys are uploaded.
//! A device id must never equal one of the user's cross-signing public keys,
//! otherwise a device query could not tell the two apart.

use keyward_proto::{DeviceId, UserId};
use rand::{Rng, distributions::Uniform};
use tracing::{info, warn};

use crate::{
    error::KeyError,
    storage::{KeyStore, StorageError},
};

/// Length of generated device ids.
const DEVICE_ID_LENGTH: usize = 10;

/// Attempts at generating an unused device id before giving up.
const MAX_GENERATE_ATTEMPTS: usize = 8;

/// Registers and deletes devices.
#[derive(Clone)]
pub struct DeviceRegistry<S: KeyStore> {
    storage: S,
}

impl<S: KeyStore> DeviceRegistry<S> {
    /// Create a registry over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Make sure a device is registered, returning its id.
    ///
    /// Without a `device_id` a random one is generated. Registering an
    /// existing device is a no-op; its display name is not changed.
    ///
    /// # Errors
    ///
    /// - `Validation` if `device_id` is one of the user's cross-signing keys
    /// - `Internal` if no unused id could be generated
    pub fn check_device_registered(
        &self,
        user: &UserId,
        device_id: Option<&str>,
        initial_display_name: Option<&str>,
    ) -> Result<DeviceId, KeyError> {
        if let Some(device_id) = device_id {
            if self.storage.register_device(user, device_id, initial_display_name)? {
                info!(%user, device_id, "registered device");
            }
            return Ok(device_id.to_string());
        }

        self.register_generated(user, initial_display_name, generate_device_id)
    }

    fn register_generated(
        &self,
        user: &UserId,
        initial_display_name: Option<&str>,
        mut generate: impl FnMut() -> DeviceId,
    ) -> Result<DeviceId, KeyError> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let candidate = generate();
            match self.storage.register_device(user, &candidate, initial_display_name) {
                Ok(true) => {
                    info!(%user, device_id = %candidate, "registered generated device");
                    return Ok(candidate);
                },
                Ok(false) | Err(StorageError::IdCollision { .. }) => {},
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%user, attempts = MAX_GENERATE_ATTEMPTS, "device id space exhausted");
        Err(KeyError::Internal(format!("could not allocate an unused device id for {user}")))
    }

    /// Remove a device with its identity keys and unclaimed one-time keys.
    ///
    /// Returns `false` if nothing was stored for the device.
    pub fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, KeyError> {
        let removed = self.storage.delete_device(user, device_id)?;
        if removed {
            info!(%user, device_id, "deleted device");
        }
        Ok(removed)
    }
}

/// Random device id of uppercase ASCII letters.
fn generate_device_id() -> DeviceId {
    rand::thread_rng()
        .sample_iter(Uniform::new_inclusive(b'A', b'Z'))
        .take(DEVICE_ID_LENGTH)
        .map(char::from)
        .collect()
}
