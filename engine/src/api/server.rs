//! Control-plane HTTP server
//!
//! Routes:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/heartbeat` | 200 while the agent is alive |
//! | GET | `/status/online` | 200 when the local server workload is ready, 503 otherwise |
//! | GET | `/state/{name}` | 200 with the document, 404 when absent |
//! | PUT | `/state/{name}` | 200 with the stored document |
//! | DELETE | `/state/{name}` | 204, also when absent |
//! | PUT | `/notifications/exit/{instance}` | 202, registers the instance |
//! | DELETE | `/notifications/exit/{instance}` | 204, marks the instance exited |
//! | GET | `/metrics` | Prometheus text (feature `metrics`) |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::AgentState;
use crate::config::ApiConfig;
use crate::error::{ApiError, Result};
use crate::telemetry::EngineMetrics;

#[derive(Clone)]
struct ServerState {
    agent: Arc<AgentState>,
    metrics: Option<Arc<EngineMetrics>>,
}

/// Build the control-plane router over `agent`
pub fn router(
    agent: Arc<AgentState>,
    metrics: Option<Arc<EngineMetrics>>,
    request_timeout: Duration,
    max_request_bytes: usize,
) -> Router {
    let router = Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/status/online", get(online))
        .route("/state/:name", get(get_state).put(update_state).delete(delete_state))
        .route("/notifications/exit/:instance", put(register_exit).delete(notify_exit));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(export_metrics));

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_request_bytes))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(ServerState { agent, metrics })
}

async fn heartbeat(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "agentId": state.agent.agent_id(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn online(State(state): State<ServerState>) -> Response {
    let online = state.agent.is_online();
    let status = if online { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "online": online }))).into_response()
}

async fn get_state(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    match state.agent.get_state(&name) {
        Some(document) => Json(document).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": format!("state '{}' not found", name) }))).into_response(),
    }
}

async fn update_state(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(document): Json<Value>,
) -> Json<Value> {
    state.agent.update_state(&name, document.clone());
    Json(document)
}

async fn delete_state(State(state): State<ServerState>, Path(name): Path<String>) -> StatusCode {
    state.agent.delete_state(&name);
    StatusCode::NO_CONTENT
}

async fn register_exit(State(state): State<ServerState>, Path(instance): Path<String>) -> StatusCode {
    state.agent.register_exit(&instance);
    StatusCode::ACCEPTED
}

async fn notify_exit(State(state): State<ServerState>, Path(instance): Path<String>) -> StatusCode {
    state.agent.notify_exit(&instance);
    StatusCode::NO_CONTENT
}

#[cfg(feature = "metrics")]
async fn export_metrics(State(state): State<ServerState>) -> Response {
    let Some(metrics) = state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.export() {
        Ok(body) => ([("content-type", "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// A bound control-plane listener, ready to serve
pub struct ControlPlaneServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl ControlPlaneServer {
    /// Bind to `address`; use port 0 for an ephemeral port
    pub async fn bind(
        address: SocketAddr,
        agent: Arc<AgentState>,
        metrics: Option<Arc<EngineMetrics>>,
        config: &ApiConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| ApiError::ServerFailed {
            reason: format!("failed to bind {}: {}", address, e),
        })?;
        let local_addr = listener.local_addr()?;

        let router = router(
            agent,
            metrics,
            Duration::from_secs(config.request_timeout_secs),
            config.max_request_bytes,
        );

        Ok(Self { listener, router, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr, "Control plane listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| {
                error!("Control plane server failed: {}", e);
                ApiError::ServerFailed { reason: e.to_string() }
            })?;

        info!("Control plane stopped");
        Ok(())
    }

    /// Serve on a background task; the task ends when `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.serve(shutdown))
    }
}
