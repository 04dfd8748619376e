//! Request and response payloads for key management operations.
//!
//! These mirror the client-server and server-server key APIs: upload, query,
//! claim, signing-key upload and signature upload. Remote failures are
//! reported per server name in `failures` maps rather than failing the whole
//! request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ids::{DeviceId, KeyId, UserId},
    keys::{CrossSigningKey, DeviceKeys, JsonObject, OneTimeKey},
};

/// Body of a key upload from a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    /// Identity keys, replacing any stored copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// One-time keys by `algorithm:key_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_keys: Option<BTreeMap<KeyId, OneTimeKey>>,
}

/// Result of a key upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysResponse {
    /// Unclaimed one-time keys remaining for the device, per algorithm
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// Body of a cross-signing key upload. Any subset of the slots may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadSigningKeysRequest {
    /// New master key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<CrossSigningKey>,
    /// New self-signing key, signed by the master key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing_key: Option<CrossSigningKey>,
    /// New user-signing key, signed by the master key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signing_key: Option<CrossSigningKey>,
}

/// Signatures to attach: target user → target key id → signed copy of the
/// target object.
///
/// The target key id is a device id or the public key of a master key. Only
/// the `signatures` of each copy are used; the signed content is always the
/// stored object.
pub type UploadSignaturesRequest = BTreeMap<UserId, BTreeMap<String, JsonObject>>;

/// Per-target failure of a signature upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFailure {
    /// Machine-readable error code, e.g. `M_INVALID_SIGNATURE`
    pub errcode: String,
    /// Human-readable reason
    pub error: String,
}

/// Result of a signature upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSignaturesResponse {
    /// Rejected targets: target user → target key id → reason
    #[serde(default)]
    pub failures: BTreeMap<UserId, BTreeMap<String, SignatureFailure>>,
}

/// Device key query. An empty device list means all devices of the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKeysRequest {
    /// Users to query and optionally which of their devices
    pub device_keys: BTreeMap<UserId, Vec<DeviceId>>,
}

/// Failure reported by (or about) a remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// HTTP-style status: 502 protocol error, 503 unreachable, 504 timeout
    pub status: u16,
    /// Human-readable reason
    pub message: String,
}

/// Result of a device key query across local and remote users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKeysResponse {
    /// Device keys: user → device → keys
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
    /// Remote servers that could not be reached
    pub failures: BTreeMap<String, RemoteFailure>,
    /// Master keys of queried users that have one
    pub master_keys: BTreeMap<UserId, CrossSigningKey>,
    /// Self-signing keys of queried users that have one
    pub self_signing_keys: BTreeMap<UserId, CrossSigningKey>,
}

/// Answer of a remote server to a federated device key query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteQueryResponse {
    /// Device keys: user → device → keys
    #[serde(default)]
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
    /// Master keys of the queried users
    #[serde(default)]
    pub master_keys: BTreeMap<UserId, CrossSigningKey>,
    /// Self-signing keys of the queried users
    #[serde(default)]
    pub self_signing_keys: BTreeMap<UserId, CrossSigningKey>,
}

/// One-time key claim: user → device → algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimKeysRequest {
    /// Algorithm wanted for each device
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, String>>,
}

/// Claimed keys: user → device → `algorithm:key_id` → key.
pub type ClaimedKeys = BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<KeyId, OneTimeKey>>>;

/// Result of a one-time key claim across local and remote users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimKeysResponse {
    /// Claimed keys
    pub one_time_keys: ClaimedKeys,
    /// Remote servers that could not be reached
    pub failures: BTreeMap<String, RemoteFailure>,
}

/// Answer of a remote server to a federated claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteClaimResponse {
    /// Claimed keys
    #[serde(default)]
    pub one_time_keys: ClaimedKeys,
}
