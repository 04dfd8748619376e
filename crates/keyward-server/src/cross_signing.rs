//! Cross-signing key management.
//!
//! Each user has at most one live key per usage:
//!
//! - **master**: root of the user's trust hierarchy
//! - **self-signing**: signs the user's own devices, signed by the master
//! - **user-signing**: signs other users' master keys, signed by the master
//!
//! Replacing the master key with a different one invalidates both dependent
//! keys. Storage removes them in the same atomic unit and bumps the master
//! generation; reads additionally ignore any dependent row whose generation
//! is not the live master's.

use std::collections::BTreeSet;

use keyward_crypto::{SignatureEngine, decode_verifying_key};
use keyward_proto::{CrossSigningKey, KeyUsage, UploadSigningKeysRequest, UserId};
use tracing::{debug, info};

use crate::{
    error::KeyError,
    storage::{CrossSigningUpdate, KeyStore, MasterChange},
};

/// Manages the per-user cross-signing hierarchy.
///
/// Cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct CrossSigningManager<S: KeyStore> {
    pub(crate) storage: S,
}

impl<S: KeyStore> CrossSigningManager<S> {
    /// Create a manager over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Upload any subset of a user's cross-signing keys.
    ///
    /// Self-signing and user-signing keys must be signed by the master key
    /// that is live after this call: the uploaded master if there is one,
    /// otherwise the stored master. Nothing is written unless every key
    /// passes validation. Re-uploading the stored master leaves it untouched,
    /// signatures included; signatures are only added by signature uploads.
    ///
    /// # Errors
    ///
    /// - `Validation` if a key is malformed or collides with a device id
    /// - `Signature` if a dependent key lacks a valid master signature, or
    ///   the master changed concurrently
    pub fn upload_signing_keys(
        &self,
        user: &UserId,
        request: &UploadSigningKeysRequest,
    ) -> Result<(), KeyError> {
        let slots = [
            (KeyUsage::Master, &request.master_key),
            (KeyUsage::SelfSigning, &request.self_signing_key),
            (KeyUsage::UserSigning, &request.user_signing_key),
        ];

        let uploaded: Vec<_> =
            slots.into_iter().filter_map(|(usage, key)| key.as_ref().map(|key| (usage, key))).collect();
        if uploaded.is_empty() {
            return Ok(());
        }

        for (usage, key) in uploaded {
            validate_structure(user, usage, key)?;
        }

        let update = CrossSigningUpdate {
            master: request.master_key.clone(),
            self_signing: request.self_signing_key.clone(),
            user_signing: request.user_signing_key.clone(),
            verified_against: None,
        };

        let update = if update.has_dependents() {
            let master = match &request.master_key {
                Some(master) => master.clone(),
                None => self.master_key(user)?.ok_or_else(|| {
                    KeyError::Signature(format!("{user} has no master key to verify against"))
                })?,
            };
            let (master_id, master_public) = master
                .single_key()
                .ok_or_else(|| KeyError::Signature("stored master key is malformed".to_string()))?;

            for (usage, key) in [
                (KeyUsage::SelfSigning, &request.self_signing_key),
                (KeyUsage::UserSigning, &request.user_signing_key),
            ] {
                if let Some(key) = key {
                    SignatureEngine::check(key, user, master_id, master_public).map_err(|e| {
                        KeyError::Signature(format!("{usage} key not signed by master key: {e}"))
                    })?;
                }
            }

            CrossSigningUpdate { verified_against: Some(master_id.clone()), ..update }
        } else {
            update
        };

        match self.storage.apply_cross_signing_update(user, &update)? {
            MasterChange::Replaced { generation } => {
                info!(%user, generation, "master key replaced");
            },
            MasterChange::Kept => debug!(%user, "master key re-uploaded unchanged"),
            MasterChange::Unchanged => {},
        }

        if update.has_dependents() {
            debug!(
                %user,
                self_signing = update.self_signing.is_some(),
                user_signing = update.user_signing.is_some(),
                "stored cross-signing keys"
            );
        }

        Ok(())
    }

    /// The user's live master key.
    pub fn master_key(&self, user: &UserId) -> Result<Option<CrossSigningKey>, KeyError> {
        Ok(self.storage.load_cross_signing_key(user, KeyUsage::Master)?.map(|row| row.key))
    }

    /// The user's live self-signing key.
    ///
    /// `None` if the stored key belongs to an older master.
    pub fn self_signing_key(&self, user: &UserId) -> Result<Option<CrossSigningKey>, KeyError> {
        self.live_dependent(user, KeyUsage::SelfSigning)
    }

    /// The user's live user-signing key.
    ///
    /// Only ever served to its owner; device queries never include it.
    pub fn user_signing_key(&self, user: &UserId) -> Result<Option<CrossSigningKey>, KeyError> {
        self.live_dependent(user, KeyUsage::UserSigning)
    }

    /// Whether `id` is the public key of one of the user's cross-signing keys.
    ///
    /// Device ids are checked against this to keep the two namespaces apart.
    pub fn is_cross_signing_key_id(&self, user: &UserId, id: &str) -> Result<bool, KeyError> {
        Ok(self.cross_signing_key_ids(user)?.contains(id))
    }

    /// Public keys of every stored cross-signing key of the user.
    pub fn cross_signing_key_ids(&self, user: &UserId) -> Result<BTreeSet<String>, KeyError> {
        let mut ids = BTreeSet::new();
        for usage in KeyUsage::ALL {
            let row = self.storage.load_cross_signing_key(user, usage)?;
            ids.extend(row.as_ref().and_then(|row| row.key.public_key()).map(str::to_string));
        }
        Ok(ids)
    }

    fn live_dependent(
        &self,
        user: &UserId,
        usage: KeyUsage,
    ) -> Result<Option<CrossSigningKey>, KeyError> {
        let Some(row) = self.storage.load_cross_signing_key(user, usage)? else {
            return Ok(None);
        };
        let Some(master) = self.storage.load_cross_signing_key(user, KeyUsage::Master)? else {
            return Ok(None);
        };

        Ok((row.generation == master.generation).then_some(row.key))
    }
}

/// Check the shape of an uploaded cross-signing key.
fn validate_structure(user: &UserId, usage: KeyUsage, key: &CrossSigningKey) -> Result<(), KeyError> {
    if key.user_id != *user {
        return Err(KeyError::Validation(format!(
            "{usage} key belongs to {}, not {user}",
            key.user_id
        )));
    }

    if key.usage != [usage] {
        return Err(KeyError::Validation(format!("{usage} key has usage {:?}", key.usage)));
    }

    let Some((key_id, public_key)) = key.single_key() else {
        return Err(KeyError::Validation(format!("{usage} key must contain exactly one key")));
    };

    if key_id.algorithm() != "ed25519" {
        return Err(KeyError::Validation(format!(
            "{usage} key has unsupported algorithm {}",
            key_id.algorithm()
        )));
    }

    if key_id.identifier() != public_key {
        return Err(KeyError::Validation(format!(
            "{usage} key id {key_id} does not match its public key"
        )));
    }

    decode_verifying_key(key_id, public_key)
        .map_err(|e| KeyError::Validation(format!("{usage} key: {e}")))?;

    Ok(())
}
