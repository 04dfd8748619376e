//! Key objects: device identity keys, one-time keys and cross-signing keys.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    ids::{DeviceId, KeyId, UserId},
    signatures::SignatureSet,
};

/// Arbitrary JSON object.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Identity keys published by a single device.
///
/// Replaced wholesale whenever the device uploads a new copy. Fields the
/// server does not interpret are preserved in `other` because they are
/// covered by the device's own signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Owner of the device
    pub user_id: UserId,
    /// Device the keys belong to
    pub device_id: DeviceId,
    /// Encryption algorithms supported by the device
    pub algorithms: Vec<String>,
    /// Public keys, e.g. `ed25519:DEVICE` and `curve25519:DEVICE`
    pub keys: BTreeMap<KeyId, String>,
    /// Signatures over the canonical form of this object
    #[serde(default, skip_serializing_if = "SignatureSet::is_empty")]
    pub signatures: SignatureSet,
    /// Server-populated data, excluded from signing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<JsonObject>,
    /// Uninterpreted fields
    #[serde(flatten)]
    pub other: JsonObject,
}

impl DeviceKeys {
    /// The device's ed25519 signing key, `keys["ed25519:<device_id>"]`.
    pub fn ed25519_key(&self) -> Option<(&KeyId, &str)> {
        self.keys
            .iter()
            .find(|(key_id, _)| key_id.algorithm() == "ed25519" && key_id.identifier() == self.device_id)
            .map(|(key_id, key)| (key_id, key.as_str()))
    }

    /// Whether `key_id` of `signer` names one of this device's own keys.
    ///
    /// Signatures by such keys come with the device's upload; all others are
    /// added through signature uploads.
    pub fn is_device_key(&self, signer: &UserId, key_id: &KeyId) -> bool {
        *signer == self.user_id && key_id.identifier() == self.device_id
    }
}

/// A one-time key as uploaded by a device.
///
/// Clients upload either a bare key string (`"curve25519:AAAAAQ": "base64"`)
/// or a signed key object (`{"key": "base64", "signatures": {...}}`).
/// Immutability is judged on [`OneTimeKey::same_key`], which compares the key
/// material only and ignores signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneTimeKey {
    /// Unsigned key string
    Bare(String),
    /// Key object carrying signatures
    Signed(SignedKey),
}

/// Signed one-time key object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedKey {
    /// Public key material
    pub key: String,
    /// Signatures in whatever shape the client uploaded; not interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<serde_json::Value>,
    /// Uninterpreted fields
    #[serde(flatten)]
    pub other: JsonObject,
}

impl OneTimeKey {
    /// Public key material.
    pub fn key(&self) -> &str {
        match self {
            Self::Bare(key) => key,
            Self::Signed(signed) => &signed.key,
        }
    }

    /// Whether `other` carries the same key material in the same shape.
    ///
    /// A bare key never matches a signed key, even with equal material.
    pub fn same_key(&self, other: &OneTimeKey) -> bool {
        match (self, other) {
            (Self::Bare(a), Self::Bare(b)) => a == b,
            (Self::Signed(a), Self::Signed(b)) => a.key == b.key,
            _ => false,
        }
    }

    /// Short description of the value shape, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bare(_) => "string",
            Self::Signed(_) => "object",
        }
    }
}

/// Purpose of a cross-signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// Root of the user's trust hierarchy
    Master,
    /// Signs the user's own devices
    SelfSigning,
    /// Signs other users' master keys
    UserSigning,
}

impl KeyUsage {
    /// All usages, master first.
    pub const ALL: [KeyUsage; 3] = [Self::Master, Self::SelfSigning, Self::UserSigning];

    /// Wire name of the usage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::SelfSigning => "self_signing",
            Self::UserSigning => "user_signing",
        }
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cross-signing key (master, self-signing or user-signing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    /// Owner of the key
    pub user_id: UserId,
    /// Declared purpose; must be exactly one usage
    pub usage: Vec<KeyUsage>,
    /// Public keys; exactly one `ed25519:<public key>` entry
    pub keys: BTreeMap<KeyId, String>,
    /// Signatures over the canonical form of this object
    #[serde(default, skip_serializing_if = "SignatureSet::is_empty")]
    pub signatures: SignatureSet,
    /// Uninterpreted fields
    #[serde(flatten)]
    pub other: JsonObject,
}

impl CrossSigningKey {
    /// The key entry, if the object carries exactly one.
    pub fn single_key(&self) -> Option<(&KeyId, &str)> {
        let mut keys = self.keys.iter();
        match (keys.next(), keys.next()) {
            (Some((key_id, key)), None) => Some((key_id, key.as_str())),
            _ => None,
        }
    }

    /// Public key string of the single key entry.
    pub fn public_key(&self) -> Option<&str> {
        self.single_key().map(|(_, key)| key)
    }
}
