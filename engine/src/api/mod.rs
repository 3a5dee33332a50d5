//! Control plane
//!
//! Every agent hosts a small HTTP service that peers use to coordinate
//! multi-role scenarios: liveness (`/heartbeat`), application readiness
//! (`/status/online`), named state documents (`/state/{name}`) and exit
//! notifications. [`ControlPlane`] is the typed view of that surface; it is
//! implemented over HTTP by [`ControlPlaneClient`] and in-process by
//! [`LocalControlPlane`], so single-node runs never touch the network.
//!
//! The client operations are idempotent. Retry policy is applied by callers,
//! never inside the client.

pub mod client;
pub mod manager;
pub mod server;
pub mod state;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ApiError, EngineError, Result};

pub use client::ControlPlaneClient;
pub use manager::ApiClientManager;
pub use server::ControlPlaneServer;
pub use state::{AgentState, LocalControlPlane};

/// Default interval between readiness probes
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Typed control-plane operations against one agent
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Where requests go, for logs and errors
    fn endpoint(&self) -> String;

    /// Liveness probe; `Ok` when the agent answers
    async fn heartbeat(&self) -> Result<()>;

    /// Application readiness, distinct from liveness
    async fn is_server_online(&self) -> Result<bool>;

    /// Fetch a state document; `None` when absent
    async fn get_state(&self, name: &str) -> Result<Option<Value>>;

    /// Create or replace a state document
    async fn update_state(&self, name: &str, document: &Value) -> Result<()>;

    /// Delete a state document; deleting an absent document succeeds
    async fn delete_state(&self, name: &str) -> Result<()>;

    /// Ask the agent to track the exit of `instance`
    async fn register_exit_notification(&self, instance: &str) -> Result<()>;

    /// Tell the agent that `instance` has exited
    async fn notify_exit(&self, instance: &str) -> Result<()>;
}

async fn poll_until<F, Fut>(
    what: &str,
    endpoint: String,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        attempts += 1;
        let ready = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = probe() => result,
        };

        match ready {
            Ok(true) => {
                debug!(what, endpoint = %endpoint, attempts, "Poll succeeded");
                return Ok(());
            }
            Ok(false) => debug!(what, endpoint = %endpoint, attempts, "Not ready yet"),
            Err(e) => debug!(what, endpoint = %endpoint, attempts, "Probe failed: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ApiError::PollingTimeout { what: what.to_string(), uri: endpoint, timeout }.into());
        }

        let pause = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Probe the liveness endpoint until it answers or `timeout` elapses
pub async fn poll_for_heartbeat(
    plane: &dyn ControlPlane,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until("heartbeat", plane.endpoint(), timeout, interval, cancel, move || async move {
        plane.heartbeat().await.map(|_| true)
    })
    .await
}

/// Probe the readiness endpoint until the server reports online or `timeout` elapses
pub async fn poll_for_server_online(
    plane: &dyn ControlPlane,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until("server online", plane.endpoint(), timeout, interval, cancel, move || async move {
        plane.is_server_online().await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn local() -> (Arc<AgentState>, LocalControlPlane) {
        let state = Arc::new(AgentState::new("server-01"));
        (state.clone(), LocalControlPlane::new(state))
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_online_waits_for_flag() {
        let (state, plane) = local();
        let flag = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.set_online(true);
        });

        let started = Instant::now();
        poll_for_server_online(&plane, Duration::from_secs(60), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_online_times_out() {
        let (_state, plane) = local();
        let result =
            poll_for_server_online(&plane, Duration::from_secs(10), Duration::from_secs(1), &CancellationToken::new())
                .await;
        assert!(matches!(result, Err(EngineError::Api(ApiError::PollingTimeout { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_within_one_interval() {
        let (_state, plane) = local();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = poll_for_server_online(&plane, Duration::from_secs(3600), Duration::from_secs(10), &cancel).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_heartbeat_on_local_plane() {
        let (_state, plane) = local();
        poll_for_heartbeat(&plane, Duration::from_secs(1), Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap();
    }
}
