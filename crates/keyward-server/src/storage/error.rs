//! Storage error types.
//!
//! - `Conflict`: one-time key upload would change an immutable key
//! - `StaleMaster`: cross-signing update was verified against a master key
//!   that is no longer live
//! - `IdCollision`: a device id and a cross-signing public key would be equal
//! - `Serialization`: failed to encode/decode a stored row
//! - `Io`: underlying storage system errors

use keyward_proto::KeyId;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// One-time key already stored with different content
    ///
    /// The whole batch is refused; nothing from it was written.
    #[error("one-time key {key_id} already exists with different content")]
    Conflict {
        /// First conflicting key id in the batch
        key_id: KeyId,
    },

    /// Live master key changed since the update was verified
    #[error("master key changed: expected {expected:?}, found {found:?}")]
    StaleMaster {
        /// Master key id the update was verified against
        expected: Option<KeyId>,
        /// Master key id currently stored
        found: Option<KeyId>,
    },

    /// Device id equal to one of the user's cross-signing public keys
    ///
    /// Raised whichever side is written second; nothing was written.
    #[error("{id} is both a device id and a cross-signing key")]
    IdCollision {
        /// The colliding id
        id: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
