//! User, device and key identifiers.
//!
//! A `UserId` names its home server (`@alice:example.org` lives on
//! `example.org`), which is how requests are split into local and remote
//! work. Identifiers never contain NUL bytes so storage backends can build
//! composite keys from them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Device identifier chosen by the client or generated at registration.
pub type DeviceId = String;

/// Fully qualified user id: `@localpart:server_name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId {
    raw: String,
    /// Byte offset of the `:` separating localpart and server name.
    colon: usize,
}

impl UserId {
    /// Parse a user id.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        if !raw.starts_with('@') || raw.contains('\0') {
            return Err(ProtocolError::InvalidUserId(raw));
        }

        let Some(colon) = raw.find(':') else {
            return Err(ProtocolError::InvalidUserId(raw));
        };

        // Both localpart and server name must be non-empty
        if colon == 1 || colon + 1 == raw.len() {
            return Err(ProtocolError::InvalidUserId(raw));
        }

        Ok(Self { raw, colon })
    }

    /// Full id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Localpart without the leading `@`.
    pub fn localpart(&self) -> &str {
        &self.raw[1..self.colon]
    }

    /// Server that owns this user.
    pub fn server_name(&self) -> &str {
        &self.raw[self.colon + 1..]
    }
}

impl TryFrom<String> for UserId {
    type Error = ProtocolError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(raw)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.raw
    }
}

impl FromStr for UserId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Key id of the form `algorithm:identifier`, e.g. `ed25519:JLAFKJWSCS`.
///
/// Used both for the `keys` map of key objects (`curve25519:DEVICE`) and for
/// one-time keys (`signed_curve25519:AAAAHQ`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId {
    raw: String,
    colon: usize,
}

impl KeyId {
    /// Parse a key id.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        let Some(colon) = raw.find(':') else {
            return Err(ProtocolError::InvalidKeyId(raw));
        };

        if colon == 0 || colon + 1 == raw.len() || raw.contains('\0') {
            return Err(ProtocolError::InvalidKeyId(raw));
        }

        Ok(Self { raw, colon })
    }

    /// Build a key id from its parts.
    pub fn new(algorithm: &str, identifier: &str) -> Result<Self> {
        Self::parse(format!("{algorithm}:{identifier}"))
    }

    /// Full id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Algorithm part (before the first `:`).
    pub fn algorithm(&self) -> &str {
        &self.raw[..self.colon]
    }

    /// Identifier part (after the first `:`).
    pub fn identifier(&self) -> &str {
        &self.raw[self.colon + 1..]
    }
}

impl TryFrom<String> for KeyId {
    type Error = ProtocolError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(raw)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.raw
    }
}

impl FromStr for KeyId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parts() {
        let user = UserId::parse("@boris:example.org").unwrap();
        assert_eq!(user.localpart(), "boris");
        assert_eq!(user.server_name(), "example.org");
        assert_eq!(user.to_string(), "@boris:example.org");
    }

    #[test]
    fn user_id_server_name_keeps_port() {
        let user = UserId::parse("@a:remote.test:8448").unwrap();
        assert_eq!(user.localpart(), "a");
        assert_eq!(user.server_name(), "remote.test:8448");
    }

    #[test]
    fn user_id_rejects_malformed() {
        for raw in ["boris:example.org", "@boris", "@:example.org", "@boris:", "@a\0b:c"] {
            assert!(UserId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn key_id_parts() {
        let key_id = KeyId::parse("signed_curve25519:AAAAHQ").unwrap();
        assert_eq!(key_id.algorithm(), "signed_curve25519");
        assert_eq!(key_id.identifier(), "AAAAHQ");
    }

    #[test]
    fn key_id_identifier_may_contain_colon_and_slash() {
        let key_id = KeyId::parse("ed25519:nq/Ov:x").unwrap();
        assert_eq!(key_id.algorithm(), "ed25519");
        assert_eq!(key_id.identifier(), "nq/Ov:x");
    }

    #[test]
    fn key_id_rejects_malformed() {
        for raw in ["ed25519", ":abc", "ed25519:"] {
            assert!(KeyId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn ids_serialize_as_strings() {
        let user = UserId::parse("@boris:example.org").unwrap();
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"@boris:example.org\"");

        let parsed: KeyId = serde_json::from_str("\"alg1:k1\"").unwrap();
        assert_eq!(parsed.as_str(), "alg1:k1");

        assert!(serde_json::from_str::<UserId>("\"nope\"").is_err());
    }
}
