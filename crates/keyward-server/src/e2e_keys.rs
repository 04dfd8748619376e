//! The key management engine as one handle.
//!
//! [`E2eKeys`] wires the managers to a shared store and federation client and
//! exposes every operation the homeserver's request handlers need. It is
//! cheap to clone; clones share state.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use keyward_proto::{
    ClaimKeysRequest, ClaimKeysResponse, ClaimedKeys, DeviceId, QueryKeysRequest,
    QueryKeysResponse, RemoteQueryResponse, UploadKeysRequest, UploadKeysResponse,
    UploadSignaturesRequest, UploadSignaturesResponse, UploadSigningKeysRequest, UserId,
};

use crate::{
    claim::KeyClaimCoordinator,
    config::EngineConfig,
    cross_signing::CrossSigningManager,
    device_keys::{DeviceKeyManager, UserDeviceKeys},
    devices::DeviceRegistry,
    error::KeyError,
    federation::FederationClient,
    query::QueryRouter,
    storage::KeyStore,
};

/// End-to-end encryption key management for one server.
pub struct E2eKeys<S: KeyStore, F: FederationClient> {
    config: EngineConfig,
    device_keys: DeviceKeyManager<S>,
    cross_signing: CrossSigningManager<S>,
    devices: DeviceRegistry<S>,
    claims: KeyClaimCoordinator<S, F>,
    queries: QueryRouter<S, F>,
}

impl<S: KeyStore, F: FederationClient> Clone for E2eKeys<S, F> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            device_keys: self.device_keys.clone(),
            cross_signing: self.cross_signing.clone(),
            devices: self.devices.clone(),
            claims: self.claims.clone(),
            queries: self.queries.clone(),
        }
    }
}

impl<S: KeyStore, F: FederationClient> E2eKeys<S, F> {
    /// Create an engine over `storage`, reaching other servers through
    /// `federation`.
    pub fn new(storage: S, federation: F, config: EngineConfig) -> Self {
        let federation = Arc::new(federation);

        Self {
            device_keys: DeviceKeyManager::new(storage.clone(), config.server_name.clone()),
            cross_signing: CrossSigningManager::new(storage.clone()),
            devices: DeviceRegistry::new(storage.clone()),
            claims: KeyClaimCoordinator::new(
                storage.clone(),
                Arc::clone(&federation),
                config.clone(),
            ),
            queries: QueryRouter::new(storage, federation, config.clone()),
            config,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Upload a device's identity keys and/or one-time keys.
    ///
    /// See [`DeviceKeyManager::upload_keys`].
    pub fn upload_keys(
        &self,
        user: &UserId,
        device_id: &str,
        request: &UploadKeysRequest,
    ) -> Result<UploadKeysResponse, KeyError> {
        self.device_keys.upload_keys(user, device_id, request)
    }

    /// Upload cross-signing keys.
    ///
    /// See [`CrossSigningManager::upload_signing_keys`].
    pub fn upload_signing_keys(
        &self,
        user: &UserId,
        request: &UploadSigningKeysRequest,
    ) -> Result<(), KeyError> {
        self.cross_signing.upload_signing_keys(user, request)
    }

    /// Attach signatures made by `signer` to devices and master keys.
    ///
    /// See [`CrossSigningManager::upload_signatures`].
    pub fn upload_signatures(
        &self,
        signer: &UserId,
        request: &UploadSignaturesRequest,
    ) -> Result<UploadSignaturesResponse, KeyError> {
        self.cross_signing.upload_signatures(signer, request)
    }

    /// Query keys of local and remote users.
    pub async fn query_devices(
        &self,
        request: &QueryKeysRequest,
        timeout: Option<Duration>,
    ) -> Result<QueryKeysResponse, KeyError> {
        self.queries.query_devices(request, timeout).await
    }

    /// Device keys of local users.
    pub fn query_local_devices(
        &self,
        query: &BTreeMap<UserId, Option<Vec<DeviceId>>>,
    ) -> Result<UserDeviceKeys, KeyError> {
        self.device_keys.query_local_devices(query)
    }

    /// Answer an inbound federated key query.
    pub fn on_federation_query_client_keys(
        &self,
        request: &QueryKeysRequest,
    ) -> Result<RemoteQueryResponse, KeyError> {
        self.queries.on_federation_query_client_keys(request)
    }

    /// Claim one-time keys of local and remote devices.
    pub async fn claim_one_time_keys(
        &self,
        request: &ClaimKeysRequest,
        timeout: Option<Duration>,
    ) -> Result<ClaimKeysResponse, KeyError> {
        self.claims.claim_one_time_keys(request, timeout).await
    }

    /// Claim one-time keys of local devices; answers inbound federated claims.
    pub fn claim_local_one_time_keys(
        &self,
        request: &ClaimKeysRequest,
    ) -> Result<ClaimedKeys, KeyError> {
        self.claims.claim_local_one_time_keys(request)
    }

    /// Unclaimed one-time keys of a device, per algorithm.
    pub fn one_time_key_counts(
        &self,
        user: &UserId,
        device_id: &str,
    ) -> Result<BTreeMap<String, u64>, KeyError> {
        self.device_keys.one_time_key_counts(user, device_id)
    }

    /// Register a device, generating an id if none is given.
    pub fn check_device_registered(
        &self,
        user: &UserId,
        device_id: Option<&str>,
        initial_display_name: Option<&str>,
    ) -> Result<DeviceId, KeyError> {
        self.devices.check_device_registered(user, device_id, initial_display_name)
    }

    /// Remove a device and all of its keys.
    pub fn delete_device(&self, user: &UserId, device_id: &str) -> Result<bool, KeyError> {
        self.devices.delete_device(user, device_id)
    }

    /// Whether `id` is the public key of one of the user's cross-signing keys.
    pub fn is_cross_signing_key_id(&self, user: &UserId, id: &str) -> Result<bool, KeyError> {
        self.cross_signing.is_cross_signing_key_id(user, id)
    }
}
