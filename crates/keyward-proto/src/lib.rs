//! Keyward wire types.
//!
//! Identifiers, key objects and request/response payloads exchanged between
//! clients, this server and remote servers. Everything here is plain data
//! with serde derives; validation that needs storage or cryptography lives in
//! `keyward-crypto` and `keyward-server`.
//!
//! Key objects are JSON objects on the wire and are signed over their
//! canonical JSON form, so every key type keeps unknown fields in a flattened
//! map. Dropping a field would change the signed bytes.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod api;
pub mod errors;
pub mod ids;
pub mod keys;
pub mod signatures;

pub use api::{
    ClaimKeysRequest, ClaimKeysResponse, ClaimedKeys, QueryKeysRequest, QueryKeysResponse,
    RemoteClaimResponse, RemoteFailure, RemoteQueryResponse, SignatureFailure,
    UploadKeysRequest, UploadKeysResponse, UploadSignaturesRequest, UploadSignaturesResponse,
    UploadSigningKeysRequest,
};
pub use errors::{ProtocolError, Result};
pub use ids::{DeviceId, KeyId, UserId};
pub use keys::{CrossSigningKey, DeviceKeys, JsonObject, KeyUsage, OneTimeKey, SignedKey};
pub use signatures::SignatureSet;
