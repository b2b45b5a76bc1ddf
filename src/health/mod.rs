use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::Resource;
use crate::controller::ControllerState;

#[derive(Serialize)]
struct JxTaskSummary {
    key: String,
    phase: String,
    state: String,
    reason: String,
}

#[derive(Serialize)]
struct StatusResponse {
    identity: String,
    leading: bool,
    caches_synced: bool,
    queue_depth: usize,
    in_flight: usize,
    pods: usize,
    jxtasks: Vec<JxTaskSummary>,
}

pub fn router(state: ControllerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
}

/// Serve the health endpoints on `addr` until `cancel` fires.
pub async fn run_health_server(addr: SocketAddr, state: ControllerState, cancel: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting health server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind health server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Health server failed");
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn readyz_handler(State(state): State<ControllerState>) -> impl IntoResponse {
    if state.caches_synced() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn status_handler(State(state): State<ControllerState>) -> impl IntoResponse {
    let mut jxtasks: Vec<JxTaskSummary> = state
        .jxtasks
        .list()
        .iter()
        .map(|t| {
            let status = t.current_status();
            JxTaskSummary {
                key: t.key().to_string(),
                phase: status.phase.to_string(),
                state: status.state.to_string(),
                reason: status.reason,
            }
        })
        .collect();
    jxtasks.sort_by(|a, b| a.key.cmp(&b.key));

    Json(StatusResponse {
        identity: state.identity.clone(),
        leading: state.is_leading(),
        caches_synced: state.caches_synced(),
        queue_depth: state.queue.len(),
        in_flight: state.queue.processing_len(),
        pods: state.pods.len(),
        jxtasks,
    })
}
