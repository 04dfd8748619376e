//! Engine configuration.

use std::time::Duration;

/// Default server name when none is configured.
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Default deadline for federated queries and claims.
pub const DEFAULT_FEDERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the key management engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name of this server; users whose id ends in `:server_name` are local
    pub server_name: String,
    /// Deadline for remote servers when the caller gives none
    pub federation_timeout: Duration,
}

impl EngineConfig {
    /// Configuration for `server_name` with default timeouts.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self { server_name: server_name.into(), ..Self::default() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            federation_timeout: DEFAULT_FEDERATION_TIMEOUT,
        }
    }
}
