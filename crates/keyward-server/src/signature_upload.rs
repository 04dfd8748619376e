//! Signature upload: attaching signatures to stored keys.
//!
//! A signer uploads signed copies of key objects. Which key may sign depends
//! on the target:
//!
//! | Target | Trusted signing keys |
//! |---|---|
//! | own master key | own device ed25519 keys |
//! | own device | own self-signing key |
//! | another user's master key | own user-signing key |
//!
//! Signatures are verified against the stored object, never the uploaded
//! copy, and only ever added. A signature already present for the same
//! `(signer, key id)` is skipped without verification, so re-uploading a
//! batch is harmless.

use keyward_crypto::SignatureEngine;
use keyward_proto::{
    CrossSigningKey, DeviceKeys, JsonObject, KeyId, KeyUsage, SignatureFailure, SignatureSet,
    UploadSignaturesRequest, UploadSignaturesResponse, UserId,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{cross_signing::CrossSigningManager, error::KeyError, storage::KeyStore};

/// Error code for an unknown target.
const NOT_FOUND: &str = "M_NOT_FOUND";
/// Error code for a signature that failed verification.
const INVALID_SIGNATURE: &str = "M_INVALID_SIGNATURE";
/// Error code for an undecodable signature map.
const INVALID_PARAM: &str = "M_INVALID_PARAM";

/// Stored object a batch of signatures is attached to.
enum Target {
    OwnMaster(CrossSigningKey),
    Device(DeviceKeys),
    OtherMaster(CrossSigningKey),
}

impl<S: KeyStore> CrossSigningManager<S> {
    /// Attach uploaded signatures to stored keys.
    ///
    /// Each target is processed independently: a failure is reported under
    /// the target in the response and never prevents other targets (or other
    /// valid signatures on the same target) from being stored.
    ///
    /// # Errors
    ///
    /// Only storage failures abort the call.
    pub fn upload_signatures(
        &self,
        signer: &UserId,
        request: &UploadSignaturesRequest,
    ) -> Result<UploadSignaturesResponse, KeyError> {
        let mut response = UploadSignaturesResponse::default();

        for (target_user, targets) in request {
            for (target_key_id, object) in targets {
                if let Some(failure) =
                    self.sign_target(signer, target_user, target_key_id, object)?
                {
                    warn!(
                        %signer,
                        %target_user,
                        target = %target_key_id,
                        errcode = %failure.errcode,
                        "signature upload rejected"
                    );
                    response
                        .failures
                        .entry(target_user.clone())
                        .or_default()
                        .insert(target_key_id.clone(), failure);
                }
            }
        }

        Ok(response)
    }

    fn sign_target(
        &self,
        signer: &UserId,
        target_user: &UserId,
        target_key_id: &str,
        object: &JsonObject,
    ) -> Result<Option<SignatureFailure>, KeyError> {
        let incoming = match incoming_signatures(signer, object) {
            Ok(incoming) => incoming,
            Err(reason) => return Ok(Some(failure(INVALID_PARAM, reason))),
        };

        let Some(target) = self.resolve_target(signer, target_user, target_key_id)? else {
            return Ok(Some(failure(NOT_FOUND, format!("no key {target_key_id} for {target_user}"))));
        };

        let outcome = match &target {
            Target::OwnMaster(master) => {
                let device_keys = self.storage.load_device_keys(signer)?;
                let lookup = |user: &UserId, key_id: &KeyId| {
                    if user != signer || key_id.algorithm() != "ed25519" {
                        return None;
                    }
                    device_keys
                        .get(key_id.identifier())
                        .and_then(DeviceKeys::ed25519_key)
                        .map(|(_, key)| key.to_string())
                };
                merge(&master.signatures, &incoming, master, lookup)
            },
            Target::Device(device_keys) => {
                let self_signing = self.self_signing_key(signer)?;
                merge(
                    &device_keys.signatures,
                    &incoming,
                    device_keys,
                    trusted(signer, self_signing.as_ref()),
                )
            },
            Target::OtherMaster(master) => {
                let user_signing = self.user_signing_key(signer)?;
                merge(&master.signatures, &incoming, master, trusted(signer, user_signing.as_ref()))
            },
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(reason) => return Ok(Some(failure(INVALID_SIGNATURE, reason))),
        };

        if !outcome.added.is_empty() {
            match &target {
                Target::OwnMaster(_) | Target::OtherMaster(_) => {
                    self.storage.add_cross_signing_signatures(
                        target_user,
                        KeyUsage::Master,
                        &outcome.added,
                    )?;
                },
                Target::Device(device_keys) => {
                    self.storage.add_device_signatures(
                        target_user,
                        &device_keys.device_id,
                        &outcome.added,
                    )?;
                },
            }
            debug!(
                %signer,
                %target_user,
                target = %target_key_id,
                added = outcome.added.len(),
                "stored signatures"
            );
        }

        if outcome.is_clean() {
            return Ok(None);
        }

        let reasons: Vec<String> =
            outcome.rejected.iter().map(|rejected| rejected.reason.to_string()).collect();
        Ok(Some(failure(INVALID_SIGNATURE, reasons.join("; "))))
    }

    fn resolve_target(
        &self,
        signer: &UserId,
        target_user: &UserId,
        target_key_id: &str,
    ) -> Result<Option<Target>, KeyError> {
        let master = self
            .master_key(target_user)?
            .filter(|master| master.public_key() == Some(target_key_id));

        match master {
            Some(master) if target_user == signer => Ok(Some(Target::OwnMaster(master))),
            Some(master) => Ok(Some(Target::OtherMaster(master))),
            None if target_user == signer => {
                Ok(self.storage.load_device_key(signer, target_key_id)?.map(Target::Device))
            },
            None => Ok(None),
        }
    }
}

/// The signer's own signatures from an uploaded object.
///
/// Signatures by other users in the copy are ignored.
fn incoming_signatures(signer: &UserId, object: &JsonObject) -> Result<SignatureSet, String> {
    let Some(signatures) = object.get("signatures") else {
        return Ok(SignatureSet::new());
    };

    let all: SignatureSet =
        serde_json::from_value(signatures.clone()).map_err(|e| format!("bad signatures: {e}"))?;

    let mut own = SignatureSet::new();
    for (user, key_id, signature) in all.iter().filter(|(user, _, _)| *user == signer) {
        own.insert_if_absent(user.clone(), key_id.clone(), signature.to_string());
    }
    Ok(own)
}

/// Key lookup trusting exactly one cross-signing key of `signer`.
fn trusted<'a>(
    signer: &'a UserId,
    key: Option<&'a CrossSigningKey>,
) -> impl Fn(&UserId, &KeyId) -> Option<String> + 'a {
    move |user, key_id| {
        let (trusted_id, public_key) = key?.single_key()?;
        (user == signer && key_id == trusted_id).then(|| public_key.to_string())
    }
}

fn merge<T, F>(
    existing: &SignatureSet,
    incoming: &SignatureSet,
    referenced: &T,
    lookup: F,
) -> Result<keyward_crypto::MergeOutcome, String>
where
    T: Serialize + ?Sized,
    F: Fn(&UserId, &KeyId) -> Option<String>,
{
    SignatureEngine::merge_signatures(existing, incoming, referenced, lookup).map_err(|e| e.to_string())
}

fn failure(errcode: &str, error: String) -> SignatureFailure {
    SignatureFailure { errcode: errcode.to_string(), error }
}
