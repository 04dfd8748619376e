//! Signature error types.

use keyward_proto::{KeyId, UserId};
use thiserror::Error;

/// Errors that can occur while signing or verifying key objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Object cannot be expressed as canonical JSON (floats, non-objects)
    #[error("not canonical JSON: {0}")]
    NonCanonical(String),

    /// Object carries no signature for the requested signer and key
    #[error("no signature by {signer} with {key_id}")]
    MissingSignature {
        /// Expected signer
        signer: UserId,
        /// Expected signing key
        key_id: KeyId,
    },

    /// Only ed25519 signing keys are supported
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Public key is not 32 bytes of base64
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    /// Signature is not 64 bytes of base64
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature does not verify against the public key
    #[error("invalid signature by {signer} with {key_id}")]
    InvalidSignature {
        /// Claimed signer
        signer: UserId,
        /// Claimed signing key
        key_id: KeyId,
    },

    /// No trusted public key is known for the signer and key id
    #[error("unknown signing key {key_id} for {signer}")]
    UnknownKey {
        /// Claimed signer
        signer: UserId,
        /// Claimed signing key
        key_id: KeyId,
    },
}
