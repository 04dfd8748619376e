//! In-process federation for multi-server tests.
//!
//! `SimFederation` routes federated key queries and claims to remote
//! [`E2eKeys`] engines living in the same process. Each remote server can be
//! given a [`Fault`] to exercise the engine's failure handling: unreachable
//! servers, garbage answers, slow answers and servers that never answer.
//!
//! Delays use `tokio::time`, so tests running with a paused clock see them
//! complete (or time out) instantly and deterministically.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use keyward_proto::{ClaimKeysRequest, QueryKeysRequest, RemoteClaimResponse, RemoteQueryResponse};
use keyward_server::{
    E2eKeys, EngineConfig, FederationClient, FederationError, KeyError, MemoryStorage, NoFederation,
};
use tracing::debug;

/// A remote homeserver engine.
pub type RemoteServer = E2eKeys<MemoryStorage, NoFederation>;

/// Misbehaviour of a simulated remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// Answers normally
    #[default]
    Healthy,
    /// Connection fails immediately
    Unreachable,
    /// Answers with an invalid response
    Protocol,
    /// Answers normally after a delay
    Delay(Duration),
    /// Never answers
    Hang,
}

#[derive(Default)]
struct SimState {
    servers: BTreeMap<String, RemoteServer>,
    faults: BTreeMap<String, Fault>,
    requests: BTreeMap<String, usize>,
}

/// Federation client backed by in-process remote engines.
///
/// Cheap to clone; clones share servers and faults, so a test can keep a
/// handle to change faults after giving a clone to the engine under test.
#[derive(Clone, Default)]
pub struct SimFederation {
    state: Arc<Mutex<SimState>>,
}

impl SimFederation {
    /// Create a federation with no servers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a healthy remote server named `server_name`, returning its engine.
    pub fn add_server(&self, server_name: &str) -> RemoteServer {
        let server = E2eKeys::new(MemoryStorage::new(), NoFederation, EngineConfig::new(server_name));
        self.lock().servers.insert(server_name.to_string(), server.clone());
        server
    }

    /// Set the fault of `server_name`.
    pub fn set_fault(&self, server_name: &str, fault: Fault) {
        self.lock().faults.insert(server_name.to_string(), fault);
    }

    /// Requests received by `server_name` so far.
    pub fn request_count(&self, server_name: &str) -> usize {
        self.lock().requests.get(server_name).copied().unwrap_or(0)
    }

    /// Look up the server and its fault, counting the request.
    fn route(&self, destination: &str) -> Result<(RemoteServer, Fault), FederationError> {
        let mut state = self.lock();
        *state.requests.entry(destination.to_string()).or_default() += 1;

        let server = state.servers.get(destination).cloned().ok_or_else(|| {
            FederationError::Unreachable {
                destination: destination.to_string(),
                reason: "no such server".to_string(),
            }
        })?;
        let fault = state.faults.get(destination).copied().unwrap_or_default();

        Ok((server, fault))
    }

    /// Apply `fault` before the server answers.
    async fn misbehave(destination: &str, fault: Fault) -> Result<(), FederationError> {
        debug!(destination, ?fault, "simulated federation request");

        match fault {
            Fault::Healthy => Ok(()),
            Fault::Unreachable => Err(FederationError::Unreachable {
                destination: destination.to_string(),
                reason: "connection refused".to_string(),
            }),
            Fault::Protocol => Err(FederationError::Protocol {
                destination: destination.to_string(),
                reason: "unexpected response body".to_string(),
            }),
            Fault::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            },
            Fault::Hang => std::future::pending().await,
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("SimFederation mutex poisoned")
    }
}

#[async_trait]
impl FederationClient for SimFederation {
    async fn query_client_keys(
        &self,
        destination: &str,
        request: &QueryKeysRequest,
        _timeout: Duration,
    ) -> Result<RemoteQueryResponse, FederationError> {
        let (server, fault) = self.route(destination)?;
        Self::misbehave(destination, fault).await?;

        server.on_federation_query_client_keys(request).map_err(|e| remote_error(destination, &e))
    }

    async fn claim_client_keys(
        &self,
        destination: &str,
        request: &ClaimKeysRequest,
        _timeout: Duration,
    ) -> Result<RemoteClaimResponse, FederationError> {
        let (server, fault) = self.route(destination)?;
        Self::misbehave(destination, fault).await?;

        let one_time_keys =
            server.claim_local_one_time_keys(request).map_err(|e| remote_error(destination, &e))?;
        Ok(RemoteClaimResponse { one_time_keys })
    }
}

/// A remote engine's error as seen over federation.
fn remote_error(destination: &str, error: &KeyError) -> FederationError {
    FederationError::Protocol {
        destination: destination.to_string(),
        reason: format!("{} {}: {error}", error.status(), error.errcode()),
    }
}
