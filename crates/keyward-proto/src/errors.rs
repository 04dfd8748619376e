//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol parsing.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing identifiers or key objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// User id is not of the form `@localpart:server_name`
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    /// Key id is not of the form `algorithm:identifier`
    #[error("invalid key id: {0:?}")]
    InvalidKeyId(String),

    /// Key object could not be decoded
    #[error("malformed key object: {0}")]
    MalformedObject(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedObject(err.to_string())
    }
}
