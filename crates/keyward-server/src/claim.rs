//! One-time key claims.
//!
//! A claim names, per device, the algorithm wanted. Local devices are served
//! from storage; each claimed key is removed atomically so it is handed out
//! at most once. Remote devices are claimed from their server through the
//! federation client, all servers concurrently under one deadline.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use keyward_proto::{ClaimKeysRequest, ClaimKeysResponse, ClaimedKeys, UserId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig, error::KeyError, fanout::fan_out, federation::FederationClient,
    storage::KeyStore,
};

/// Hands out one-time keys of local and remote devices.
pub struct KeyClaimCoordinator<S: KeyStore, F: FederationClient> {
    storage: S,
    federation: Arc<F>,
    config: EngineConfig,
}

impl<S: KeyStore, F: FederationClient> Clone for KeyClaimCoordinator<S, F> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            federation: Arc::clone(&self.federation),
            config: self.config.clone(),
        }
    }
}

impl<S: KeyStore, F: FederationClient> KeyClaimCoordinator<S, F> {
    /// Create a coordinator.
    pub fn new(storage: S, federation: Arc<F>, config: EngineConfig) -> Self {
        Self { storage, federation, config }
    }

    /// Claim keys of local and remote devices.
    ///
    /// Remote servers that fail or miss the deadline (`timeout`, or the
    /// configured federation timeout) are listed in `failures`; keys they
    /// would have returned are simply absent. Users for whom nothing could
    /// be claimed are omitted.
    ///
    /// # Errors
    ///
    /// `Storage` if claiming local keys fails.
    pub async fn claim_one_time_keys(
        &self,
        request: &ClaimKeysRequest,
        timeout: Option<Duration>,
    ) -> Result<ClaimKeysResponse, KeyError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.federation_timeout);

        let mut local = ClaimKeysRequest::default();
        let mut remote: BTreeMap<String, ClaimKeysRequest> = BTreeMap::new();
        for (user, devices) in &request.one_time_keys {
            let partition = if self.is_local(user) {
                &mut local
            } else {
                remote.entry(user.server_name().to_string()).or_default()
            };
            partition.one_time_keys.insert(user.clone(), devices.clone());
        }

        let mut response =
            ClaimKeysResponse { one_time_keys: self.claim_local_one_time_keys(&local)?, ..Default::default() };

        let asked = remote.clone();
        let federation = &self.federation;
        let results = fan_out(remote, deadline, |destination, request, remaining| {
            let federation = Arc::clone(federation);
            async move { federation.claim_client_keys(&destination, &request, remaining).await }
        })
        .await;

        for (destination, result) in results {
            match result {
                Ok(answer) => {
                    let wanted = asked.get(&destination).map(|r| &r.one_time_keys);
                    for (user, devices) in answer.one_time_keys {
                        let Some(requested) = wanted.and_then(|w| w.get(&user)) else {
                            warn!(%destination, %user, "dropping keys for a user that was not asked");
                            continue;
                        };
                        let devices: BTreeMap<_, _> = devices
                            .into_iter()
                            .filter(|(device_id, keys)| {
                                requested.contains_key(device_id) && !keys.is_empty()
                            })
                            .collect();
                        if !devices.is_empty() {
                            response.one_time_keys.insert(user, devices);
                        }
                    }
                },
                Err(e) => {
                    response.failures.insert(destination, e.to_failure());
                },
            }
        }

        info!(
            users = response.one_time_keys.len(),
            failures = response.failures.len(),
            "claimed one-time keys"
        );

        Ok(response)
    }

    /// Claim keys of local devices only.
    ///
    /// Serves inbound federated claims as well as the local half of
    /// [`Self::claim_one_time_keys`]. For each device the key with the lowest
    /// key id of the wanted algorithm is taken. Users of other servers are
    /// ignored.
    ///
    /// # Errors
    ///
    /// `Storage` if a storage operation fails.
    pub fn claim_local_one_time_keys(
        &self,
        request: &ClaimKeysRequest,
    ) -> Result<ClaimedKeys, KeyError> {
        let mut claimed = ClaimedKeys::new();

        for (user, devices) in &request.one_time_keys {
            if !self.is_local(user) {
                warn!(%user, "ignoring claim for remote user");
                continue;
            }

            for (device_id, algorithm) in devices {
                match self.storage.take_one_time_key(user, device_id, algorithm)? {
                    Some((key_id, key)) => {
                        debug!(%user, device_id, %key_id, "claimed one-time key");
                        claimed
                            .entry(user.clone())
                            .or_default()
                            .entry(device_id.clone())
                            .or_default()
                            .insert(key_id, key);
                    },
                    None => debug!(%user, device_id, algorithm, "no one-time key left"),
                }
            }
        }

        Ok(claimed)
    }

    fn is_local(&self, user: &UserId) -> bool {
        user.server_name() == self.config.server_name
    }
}

#[cfg(test)]
mod tests {
    use keyward_proto::{KeyId, OneTimeKey};

    use super::*;
    use crate::{federation::NoFederation, storage::MemoryStorage};

    fn user() -> UserId {
        UserId::parse("@boris:hs").unwrap()
    }

    fn coordinator(storage: MemoryStorage) -> KeyClaimCoordinator<MemoryStorage, NoFederation> {
        KeyClaimCoordinator::new(storage, Arc::new(NoFederation), EngineConfig::new("hs"))
    }

    fn store(storage: &MemoryStorage, device_id: &str, keys: &[(&str, &str)]) {
        let batch: Vec<_> = keys
            .iter()
            .map(|(id, key)| (KeyId::parse(*id).unwrap(), OneTimeKey::Bare((*key).to_string())))
            .collect();
        storage.add_one_time_keys(&user(), device_id, &batch).unwrap();
    }

    fn claim(user: UserId, device_id: &str, algorithm: &str) -> ClaimKeysRequest {
        ClaimKeysRequest {
            one_time_keys: BTreeMap::from([(
                user,
                BTreeMap::from([(device_id.to_string(), algorithm.to_string())]),
            )]),
        }
    }

    #[test]
    fn each_key_is_claimed_once() {
        let storage = MemoryStorage::new();
        store(&storage, "abc", &[("alg1:k2", "key2"), ("alg1:k1", "key1")]);
        let coordinator = coordinator(storage);

        let request = claim(user(), "abc", "alg1");
        let first = coordinator.claim_local_one_time_keys(&request).unwrap();
        let second = coordinator.claim_local_one_time_keys(&request).unwrap();
        let third = coordinator.claim_local_one_time_keys(&request).unwrap();

        let claimed_id = |keys: &ClaimedKeys| {
            keys[&user()]["abc"].keys().next().map(|id| id.as_str().to_string()).unwrap()
        };
        assert_eq!(claimed_id(&first), "alg1:k1");
        assert_eq!(claimed_id(&second), "alg1:k2");
        assert!(third.is_empty());
    }

    #[test]
    fn unknown_algorithm_claims_nothing() {
        let storage = MemoryStorage::new();
        store(&storage, "abc", &[("alg1:k1", "key1")]);
        let coordinator = coordinator(storage.clone());

        let claimed = coordinator.claim_local_one_time_keys(&claim(user(), "abc", "alg2")).unwrap();
        assert!(claimed.is_empty());
        assert_eq!(storage.total_one_time_keys(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_per_destination() {
        let storage = MemoryStorage::new();
        store(&storage, "abc", &[("alg1:k1", "key1")]);
        let coordinator = coordinator(storage);

        let mut request = claim(user(), "abc", "alg1");
        request.one_time_keys.extend(claim(UserId::parse("@alice:remote").unwrap(), "D", "alg1").one_time_keys);

        let response = coordinator.claim_one_time_keys(&request, None).await.unwrap();
        assert_eq!(response.one_time_keys[&user()]["abc"].len(), 1);
        assert_eq!(response.failures["remote"].status, 503);
        assert_eq!(response.failures.len(), 1);
    }
}
