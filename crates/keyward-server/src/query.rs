//! Device key queries across local and remote users.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use keyward_proto::{
    CrossSigningKey, DeviceId, QueryKeysRequest, QueryKeysResponse, RemoteQueryResponse, UserId,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig, cross_signing::CrossSigningManager, device_keys::DeviceKeyManager,
    error::KeyError, fanout::fan_out, federation::FederationClient, storage::KeyStore,
};

/// Answers device key queries, fanning remote users out to their servers.
pub struct QueryRouter<S: KeyStore, F: FederationClient> {
    device_keys: DeviceKeyManager<S>,
    cross_signing: CrossSigningManager<S>,
    federation: Arc<F>,
    config: EngineConfig,
}

impl<S: KeyStore, F: FederationClient> Clone for QueryRouter<S, F> {
    fn clone(&self) -> Self {
        Self {
            device_keys: self.device_keys.clone(),
            cross_signing: self.cross_signing.clone(),
            federation: Arc::clone(&self.federation),
            config: self.config.clone(),
        }
    }
}

impl<S: KeyStore, F: FederationClient> QueryRouter<S, F> {
    /// Create a router.
    pub fn new(storage: S, federation: Arc<F>, config: EngineConfig) -> Self {
        Self {
            device_keys: DeviceKeyManager::new(storage.clone(), config.server_name.clone()),
            cross_signing: CrossSigningManager::new(storage),
            federation,
            config,
        }
    }

    /// Query device and cross-signing keys of local and remote users.
    ///
    /// Every requested local user appears in `device_keys`. Remote servers
    /// are queried concurrently; each one that fails or misses the deadline
    /// (`timeout`, or the configured federation timeout) gets an entry in
    /// `failures` and the others are unaffected.
    ///
    /// # Errors
    ///
    /// `Storage` if reading local keys fails.
    pub async fn query_devices(
        &self,
        request: &QueryKeysRequest,
        timeout: Option<Duration>,
    ) -> Result<QueryKeysResponse, KeyError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.federation_timeout);

        let mut local = QueryKeysRequest::default();
        let mut remote: BTreeMap<String, QueryKeysRequest> = BTreeMap::new();
        for (user, devices) in &request.device_keys {
            let partition = if user.server_name() == self.config.server_name {
                &mut local
            } else {
                remote.entry(user.server_name().to_string()).or_default()
            };
            partition.device_keys.insert(user.clone(), devices.clone());
        }

        let answer = self.on_federation_query_client_keys(&local)?;
        let mut response = QueryKeysResponse {
            device_keys: answer.device_keys,
            master_keys: answer.master_keys,
            self_signing_keys: answer.self_signing_keys,
            ..Default::default()
        };

        let asked = remote.clone();
        let federation = &self.federation;
        let results = fan_out(remote, deadline, |destination, request, remaining| {
            let federation = Arc::clone(federation);
            async move { federation.query_client_keys(&destination, &request, remaining).await }
        })
        .await;

        for (destination, result) in results {
            match result {
                Ok(answer) => {
                    let users: BTreeSet<&UserId> =
                        asked.get(&destination).map(|r| r.device_keys.keys().collect()).unwrap_or_default();
                    merge_remote(&mut response, &destination, &users, answer);
                },
                Err(e) => {
                    response.failures.insert(destination, e.to_failure());
                },
            }
        }

        info!(
            users = response.device_keys.len(),
            failures = response.failures.len(),
            "answered device query"
        );

        Ok(response)
    }

    /// Answer a query for local users only.
    ///
    /// Serves inbound federated queries and the local half of
    /// [`Self::query_devices`]. Users of other servers are ignored.
    ///
    /// # Errors
    ///
    /// `Storage` if reading keys fails.
    pub fn on_federation_query_client_keys(
        &self,
        request: &QueryKeysRequest,
    ) -> Result<RemoteQueryResponse, KeyError> {
        let query: BTreeMap<UserId, Option<Vec<DeviceId>>> = request
            .device_keys
            .iter()
            .map(|(user, devices)| (user.clone(), Some(devices.clone())))
            .collect();

        let device_keys = self.device_keys.query_local_devices(&query)?;

        let mut answer = RemoteQueryResponse::default();
        for user in device_keys.keys() {
            if let Some(master) = self.cross_signing.master_key(user)? {
                answer.master_keys.insert(user.clone(), master);
            }
            if let Some(self_signing) = self.cross_signing.self_signing_key(user)? {
                answer.self_signing_keys.insert(user.clone(), self_signing);
            }
        }
        answer.device_keys = device_keys;

        debug!(users = answer.device_keys.len(), "answered local key query");
        Ok(answer)
    }
}

/// Fold a remote server's answer into `response`, keeping only the users
/// that were asked of it.
fn merge_remote(
    response: &mut QueryKeysResponse,
    destination: &str,
    asked: &BTreeSet<&UserId>,
    answer: RemoteQueryResponse,
) {
    let RemoteQueryResponse { device_keys, master_keys, self_signing_keys } = answer;

    let master_keys = owned_keys(destination, asked, master_keys);
    let self_signing_keys = owned_keys(destination, asked, self_signing_keys);

    for (user, mut devices) in device_keys {
        if !asked.contains(&user) {
            warn!(destination, %user, "dropping devices of a user that was not asked");
            continue;
        }

        let hidden: BTreeSet<&str> = [master_keys.get(&user), self_signing_keys.get(&user)]
            .into_iter()
            .flatten()
            .filter_map(CrossSigningKey::public_key)
            .collect();
        devices.retain(|device_id, _| !hidden.contains(device_id.as_str()));

        response.device_keys.insert(user, devices);
    }

    response.master_keys.extend(master_keys);
    response.self_signing_keys.extend(self_signing_keys);
}

/// Cross-signing keys of asked users whose `user_id` names that user.
fn owned_keys(
    destination: &str,
    asked: &BTreeSet<&UserId>,
    keys: BTreeMap<UserId, CrossSigningKey>,
) -> BTreeMap<UserId, CrossSigningKey> {
    keys.into_iter()
        .filter(|(user, key)| {
            let keep = asked.contains(user) && key.user_id == *user;
            if !keep {
                warn!(destination, %user, "dropping cross-signing key from remote answer");
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn cross_signing_key(owner: &str, public_key: &str) -> CrossSigningKey {
        serde_json::from_value(json!({
            "user_id": owner,
            "usage": ["master"],
            "keys": {format!("ed25519:{public_key}"): public_key}
        }))
        .unwrap()
    }

    #[test]
    fn remote_answer_is_restricted_to_asked_users() {
        let alice = user("@alice:remote");
        let mallory = user("@mallory:remote");
        let asked = BTreeSet::from([&alice]);

        let answer = RemoteQueryResponse {
            device_keys: BTreeMap::from([
                (alice.clone(), BTreeMap::new()),
                (mallory.clone(), BTreeMap::new()),
            ]),
            master_keys: BTreeMap::from([
                (alice.clone(), cross_signing_key("@mallory:remote", "AAAA")),
                (mallory.clone(), cross_signing_key("@mallory:remote", "BBBB")),
            ]),
            self_signing_keys: BTreeMap::new(),
        };

        let mut response = QueryKeysResponse::default();
        merge_remote(&mut response, "remote", &asked, answer);

        assert!(response.device_keys.contains_key(&alice));
        assert!(!response.device_keys.contains_key(&mallory));
        assert!(response.master_keys.is_empty());
    }

    #[test]
    fn remote_cross_signing_ids_are_not_devices() {
        let alice = user("@alice:remote");
        let asked = BTreeSet::from([&alice]);

        let device = |device_id: &str| -> keyward_proto::DeviceKeys {
            serde_json::from_value(json!({
                "user_id": "@alice:remote",
                "device_id": device_id,
                "algorithms": [],
                "keys": {}
            }))
            .unwrap()
        };

        let answer = RemoteQueryResponse {
            device_keys: BTreeMap::from([(
                alice.clone(),
                BTreeMap::from([("PHONE".to_string(), device("PHONE")), ("AAAA".to_string(), device("AAAA"))]),
            )]),
            master_keys: BTreeMap::from([(alice.clone(), cross_signing_key("@alice:remote", "AAAA"))]),
            self_signing_keys: BTreeMap::new(),
        };

        let mut response = QueryKeysResponse::default();
        merge_remote(&mut response, "remote", &asked, answer);

        assert_eq!(response.device_keys[&alice].keys().collect::<Vec<_>>(), vec!["PHONE"]);
        assert!(response.master_keys.contains_key(&alice));
    }
}
