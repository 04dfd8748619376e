//! Keyward key management engine.
//!
//! Server-side handling of end-to-end encryption keys for a federated
//! homeserver: device identity keys, one-time keys, cross-signing keys and
//! the signatures users attach to them.
//!
//! # Architecture
//!
//! Managers hold no state of their own. Everything lives behind a
//! [`KeyStore`] whose methods are each one atomic unit, so the managers can
//! be cloned freely and called from any number of concurrent requests.
//! Remote users are reached through a [`FederationClient`] supplied by the
//! embedding server.
//!
//! # Components
//!
//! - [`DeviceKeyManager`]: device identity keys and one-time key uploads
//! - [`CrossSigningManager`]: master, self-signing and user-signing keys,
//!   and signature uploads
//! - [`KeyClaimCoordinator`]: exactly-once one-time key claims
//! - [`QueryRouter`]: device key queries fanned out across servers
//! - [`DeviceRegistry`]: device registration and deletion
//! - [`E2eKeys`]: all of the above as one handle
//!
//! Storage backends: [`MemoryStorage`], [`RedbStorage`] and the fault
//! injecting [`ChaoticStorage`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod claim;
pub mod config;
mod cross_signing;
mod device_keys;
mod devices;
mod e2e_keys;
mod error;
mod fanout;
pub mod federation;
mod query;
mod signature_upload;
pub mod storage;

pub use claim::KeyClaimCoordinator;
pub use config::EngineConfig;
pub use cross_signing::CrossSigningManager;
pub use device_keys::{DeviceKeyManager, UserDeviceKeys};
pub use devices::DeviceRegistry;
pub use e2e_keys::E2eKeys;
pub use error::KeyError;
pub use federation::{FederationClient, FederationError, NoFederation};
pub use query::QueryRouter;
pub use storage::{
    ChaoticStorage, CrossSigningUpdate, DeviceRecord, KeyStore, MasterChange, MemoryStorage,
    RedbStorage, StorageError, StoredCrossSigningKey,
};
