//! Concurrent per-server federation requests under one deadline.

use std::{collections::BTreeMap, future::Future, time::Duration};

use futures::future::join_all;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::federation::FederationError;

/// Send one request per destination, all concurrently, and collect the
/// outcome of each.
///
/// Every request is bounded by `deadline`; a request still pending then is
/// dropped and reported as [`FederationError::Timeout`]. Results that
/// completed in time are kept whatever happens to the others.
pub(crate) async fn fan_out<Req, Resp, Fut, C>(
    requests: BTreeMap<String, Req>,
    deadline: Instant,
    call: C,
) -> BTreeMap<String, Result<Resp, FederationError>>
where
    C: Fn(String, Req, Duration) -> Fut,
    Fut: Future<Output = Result<Resp, FederationError>>,
{
    let pending = requests.into_iter().map(|(destination, request)| {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = call(destination.clone(), request, remaining);

        async move {
            let result = match timeout_at(deadline, response).await {
                Ok(result) => result,
                Err(_) => Err(FederationError::Timeout { destination: destination.clone() }),
            };

            match &result {
                Ok(_) => debug!(%destination, "remote server answered"),
                Err(e) => warn!(%destination, error = %e, "remote server failed"),
            }

            (destination, result)
        }
    });

    join_all(pending).await.into_iter().collect()
}
