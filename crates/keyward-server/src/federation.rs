//! Federation client abstraction.
//!
//! The engine never talks to the network itself. Remote device queries and
//! one-time key claims go through a [`FederationClient`], which the embedding
//! server implements over its federation transport:
//!
//! - **Production**: the homeserver's signed server-to-server HTTP client
//! - **Simulation**: in-process remote engines (see `keyward-harness`)
//!
//! Implementations report failures as [`FederationError`]; the engine turns
//! them into per-server entries of the response's `failures` map and never
//! lets one server's failure affect another's results.

use std::time::Duration;

use async_trait::async_trait;
use keyward_proto::{
    ClaimKeysRequest, QueryKeysRequest, RemoteClaimResponse, RemoteFailure, RemoteQueryResponse,
};
use thiserror::Error;

/// Failure talking to one remote server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FederationError {
    /// No answer before the deadline
    #[error("request to {destination} timed out")]
    Timeout {
        /// Remote server name
        destination: String,
    },

    /// Server could not be reached (DNS, connection refused, backoff)
    #[error("{destination} unreachable: {reason}")]
    Unreachable {
        /// Remote server name
        destination: String,
        /// Underlying cause
        reason: String,
    },

    /// Server answered with an error or an undecodable body
    #[error("{destination} returned an invalid response: {reason}")]
    Protocol {
        /// Remote server name
        destination: String,
        /// Underlying cause
        reason: String,
    },
}

impl FederationError {
    /// HTTP-style status reported in `failures` maps.
    pub fn status(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            Self::Unreachable { .. } => 503,
            Self::Protocol { .. } => 502,
        }
    }

    /// The `failures` map entry for this error.
    pub fn to_failure(&self) -> RemoteFailure {
        RemoteFailure { status: self.status(), message: self.to_string() }
    }
}

/// Server-to-server key API.
///
/// `timeout` is the time remaining before the caller's deadline.
/// Implementations may use it for their own transport timeouts; the engine
/// enforces the deadline regardless.
#[async_trait]
pub trait FederationClient: Send + Sync + 'static {
    /// Query device and cross-signing keys of users on `destination`.
    async fn query_client_keys(
        &self,
        destination: &str,
        request: &QueryKeysRequest,
        timeout: Duration,
    ) -> Result<RemoteQueryResponse, FederationError>;

    /// Claim one-time keys of devices on `destination`.
    async fn claim_client_keys(
        &self,
        destination: &str,
        request: &ClaimKeysRequest,
        timeout: Duration,
    ) -> Result<RemoteClaimResponse, FederationError>;
}

/// Federation client for servers that do not federate.
///
/// Every remote server is reported unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFederation;

#[async_trait]
impl FederationClient for NoFederation {
    async fn query_client_keys(
        &self,
        destination: &str,
        _request: &QueryKeysRequest,
        _timeout: Duration,
    ) -> Result<RemoteQueryResponse, FederationError> {
        Err(FederationError::Unreachable {
            destination: destination.to_string(),
            reason: "federation disabled".to_string(),
        })
    }

    async fn claim_client_keys(
        &self,
        destination: &str,
        _request: &ClaimKeysRequest,
        _timeout: Duration,
    ) -> Result<RemoteClaimResponse, FederationError> {
        Err(FederationError::Unreachable {
            destination: destination.to_string(),
            reason: "federation disabled".to_string(),
        })
    }
}
