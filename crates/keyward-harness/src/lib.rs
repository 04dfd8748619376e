//! Simulation harness for keyward multi-server testing.
//!
//! In-process implementations of the federation boundary and seeded signing
//! fixtures, so tests can run several homeservers' key engines side by side
//! and make them misbehave on demand.
//!
//! # Simulated Federation
//!
//! [`SimFederation`] implements `FederationClient` by calling remote
//! engines directly. Each remote server can be made unreachable, slow,
//! broken or silent with a [`Fault`].
//!
//! # Fixtures
//!
//! [`TestUser`] holds real, seed-derived ed25519 keys and builds correctly
//! signed device keys, cross-signing keys and one-time keys.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod sim_federation;

pub use fixtures::{FixtureError, ONE_TIME_KEY_ALGORITHM, TestUser, sign_master_of};
pub use sim_federation::{Fault, RemoteServer, SimFederation};
