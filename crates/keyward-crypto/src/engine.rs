//! Signature verification and merging for key objects.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use keyward_proto::{KeyId, SignatureSet, UserId};
use serde::Serialize;
use serde_json::Value;

use crate::{
    canonical::signable_json,
    encoding::{decode_base64, decode_verifying_key, encode_base64},
    error::SignatureError,
};

/// An incoming signature that was not merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSignature {
    /// Claimed signer
    pub signer: UserId,
    /// Claimed signing key
    pub key_id: KeyId,
    /// Why the signature was rejected
    pub reason: SignatureError,
}

/// Result of merging an incoming signature set into an existing one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Existing signatures plus every newly accepted one
    pub merged: SignatureSet,
    /// Only the newly accepted signatures
    pub added: SignatureSet,
    /// Incoming signatures that failed verification
    pub rejected: Vec<RejectedSignature>,
}

impl MergeOutcome {
    /// Whether every incoming signature was either already known or accepted.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Ed25519 signature engine for canonical JSON key objects.
///
/// Stateless: all methods are associated functions.
pub struct SignatureEngine;

impl SignatureEngine {
    /// Whether `object` carries a valid signature by `signer` with `key_id`.
    pub fn verify<T: Serialize + ?Sized>(
        object: &T,
        signer: &UserId,
        key_id: &KeyId,
        public_key: &str,
    ) -> bool {
        Self::check(object, signer, key_id, public_key).is_ok()
    }

    /// Like [`SignatureEngine::verify`], reporting why verification failed.
    pub fn check<T: Serialize + ?Sized>(
        object: &T,
        signer: &UserId,
        key_id: &KeyId,
        public_key: &str,
    ) -> Result<(), SignatureError> {
        let value =
            serde_json::to_value(object).map_err(|e| SignatureError::NonCanonical(e.to_string()))?;

        let signature = value
            .get("signatures")
            .and_then(|sigs| sigs.get(signer.as_str()))
            .and_then(|sigs| sigs.get(key_id.as_str()))
            .and_then(Value::as_str)
            .ok_or_else(|| SignatureError::MissingSignature {
                signer: signer.clone(),
                key_id: key_id.clone(),
            })?;

        let message = signable_json(&value)?;
        Self::verify_bytes(&message, signer, key_id, signature, public_key)
    }

    /// Verify a detached `signature` over the signed form of `object`.
    pub fn check_detached<T: Serialize + ?Sized>(
        object: &T,
        signer: &UserId,
        key_id: &KeyId,
        signature: &str,
        public_key: &str,
    ) -> Result<(), SignatureError> {
        let message = signable_json(object)?;
        Self::verify_bytes(&message, signer, key_id, signature, public_key)
    }

    /// Merge `incoming` signatures over `referenced` into `existing`.
    ///
    /// For each incoming `(signer, key id)`:
    /// - already present in `existing`: ignored, whatever its content
    /// - `key_lookup` knows no trusted key for it: rejected
    /// - verifies against the trusted key: added
    /// - otherwise: rejected
    ///
    /// Rejections never stop the remaining entries from being processed.
    /// Errors only if `referenced` has no canonical form.
    pub fn merge_signatures<T, F>(
        existing: &SignatureSet,
        incoming: &SignatureSet,
        referenced: &T,
        key_lookup: F,
    ) -> Result<MergeOutcome, SignatureError>
    where
        T: Serialize + ?Sized,
        F: Fn(&UserId, &KeyId) -> Option<String>,
    {
        let message = signable_json(referenced)?;

        let mut outcome = MergeOutcome { merged: existing.clone(), ..MergeOutcome::default() };

        for (signer, key_id, signature) in incoming.iter() {
            if existing.contains(signer, key_id) {
                continue;
            }

            let verified = match key_lookup(signer, key_id) {
                Some(public_key) => {
                    Self::verify_bytes(&message, signer, key_id, signature, &public_key)
                },
                None => Err(SignatureError::UnknownKey {
                    signer: signer.clone(),
                    key_id: key_id.clone(),
                }),
            };

            match verified {
                Ok(()) => {
                    outcome.merged.insert_if_absent(
                        signer.clone(),
                        key_id.clone(),
                        signature.to_string(),
                    );
                    outcome.added.insert_if_absent(
                        signer.clone(),
                        key_id.clone(),
                        signature.to_string(),
                    );
                },
                Err(reason) => outcome.rejected.push(RejectedSignature {
                    signer: signer.clone(),
                    key_id: key_id.clone(),
                    reason,
                }),
            }
        }

        Ok(outcome)
    }

    /// Detached unpadded-base64 signature over the signed form of `object`.
    pub fn sign<T: Serialize + ?Sized>(
        object: &T,
        signing_key: &SigningKey,
    ) -> Result<String, SignatureError> {
        let message = signable_json(object)?;
        Ok(encode_base64(signing_key.sign(&message).to_bytes()))
    }

    /// Sign a JSON object in place, adding `signatures[signer][key_id]`.
    ///
    /// Existing signatures are kept and do not affect the new one.
    pub fn sign_value(
        object: &mut Value,
        signer: &UserId,
        key_id: &KeyId,
        signing_key: &SigningKey,
    ) -> Result<(), SignatureError> {
        let signature = Self::sign(&*object, signing_key)?;

        let Value::Object(map) = object else {
            return Err(SignatureError::NonCanonical("signed value must be a JSON object".to_string()));
        };

        let signatures = map
            .entry("signatures")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let Value::Object(signatures) = signatures else {
            return Err(SignatureError::NonCanonical("signatures must be an object".to_string()));
        };

        let by_signer = signatures
            .entry(signer.as_str())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let Value::Object(by_signer) = by_signer else {
            return Err(SignatureError::NonCanonical("signatures must be an object".to_string()));
        };

        by_signer.insert(key_id.to_string(), Value::String(signature));
        Ok(())
    }

    fn verify_bytes(
        message: &[u8],
        signer: &UserId,
        key_id: &KeyId,
        signature: &str,
        public_key: &str,
    ) -> Result<(), SignatureError> {
        let verifying_key = decode_verifying_key(key_id, public_key)?;

        let signature_bytes = decode_base64(signature)
            .map_err(|e| SignatureError::MalformedSignature(format!("{key_id}: {e}")))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| SignatureError::MalformedSignature(format!("{key_id}: {e}")))?;

        verifying_key.verify(message, &signature).map_err(|_| SignatureError::InvalidSignature {
            signer: signer.clone(),
            key_id: key_id.clone(),
        })
    }
}
