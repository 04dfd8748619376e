//! Engine error types.
//!
//! Every fallible engine operation returns [`KeyError`]. Validation and
//! conflict errors are raised before anything is written. Remote server
//! failures are never raised: they are reported per server in the `failures`
//! map of query and claim responses (see [`crate::FederationError`]).

use keyward_crypto::SignatureError;
use keyward_proto::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by key management operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Malformed or inconsistent request
    #[error("invalid request: {0}")]
    Validation(String),

    /// One-time key upload would change an existing key
    #[error("one-time key conflict: {0}")]
    Conflict(String),

    /// Cross-signing key lacks a valid signature from the live master key
    #[error("signature check failed: {0}")]
    Signature(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The server could not complete a request that was itself valid
    #[error("internal error: {0}")]
    Internal(String),
}

impl KeyError {
    /// HTTP status code for the error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Conflict(_) | Self::Signature(_) => 400,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable error code.
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::Validation(_) => "M_INVALID_PARAM",
            Self::Conflict(_) => "M_UNKNOWN",
            Self::Signature(_) => "M_INVALID_SIGNATURE",
            Self::Storage(_) | Self::Internal(_) => "M_UNKNOWN",
        }
    }
}

impl From<StorageError> for KeyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => Self::Conflict(err.to_string()),
            StorageError::StaleMaster { .. } => Self::Signature(err.to_string()),
            StorageError::IdCollision { .. } => Self::Validation(err.to_string()),
            StorageError::Serialization(_) | StorageError::Io(_) => Self::Storage(err),
        }
    }
}

impl From<ProtocolError> for KeyError {
    fn from(err: ProtocolError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<SignatureError> for KeyError {
    fn from(err: SignatureError) -> Self {
        Self::Signature(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use keyward_proto::KeyId;

    use super::*;

    #[test]
    fn storage_conflicts_map_to_client_errors() {
        let conflict: KeyError =
            StorageError::Conflict { key_id: KeyId::parse("alg1:k1").unwrap() }.into();
        assert!(matches!(conflict, KeyError::Conflict(_)));
        assert_eq!(conflict.status(), 400);

        let stale: KeyError = StorageError::StaleMaster { expected: None, found: None }.into();
        assert!(matches!(stale, KeyError::Signature(_)));

        let collision: KeyError = StorageError::IdCollision { id: "ABC".to_string() }.into();
        assert!(matches!(collision, KeyError::Validation(_)));

        let io: KeyError = StorageError::Io("disk full".to_string()).into();
        assert_eq!(io.status(), 500);
    }
}
