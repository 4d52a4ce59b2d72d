//! Axum status surface for the ingestion worker.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use regintel_core::IngestionStatus;
use regintel_sync::{RunOptions, RunState, TriggerResult, WorkerHandle};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "regintel-web";

#[derive(Clone)]
pub struct AppState {
    pub run_state: Arc<RunState>,
    /// `None` serves status only; run requests answer 503.
    pub worker: Option<WorkerHandle>,
}

impl AppState {
    pub fn new(run_state: Arc<RunState>) -> Self {
        Self {
            run_state,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: WorkerHandle) -> Self {
        self.worker = Some(worker);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    status: &'static str,
    dry_run: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/ingestion/status", get(status_handler))
        .route("/api/ingestion/run", post(run_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status server listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<IngestionStatus> {
    Json(state.run_state.snapshot().await)
}

async fn run_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunQuery>) -> Response {
    let Some(worker) = &state.worker else {
        return run_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", query.dry_run);
    };

    match worker.trigger(RunOptions {
        dry_run: query.dry_run,
    }) {
        TriggerResult::Queued => run_response(StatusCode::ACCEPTED, "queued", query.dry_run),
        TriggerResult::Busy => run_response(StatusCode::CONFLICT, "busy", query.dry_run),
        TriggerResult::Stopped => run_response(StatusCode::CONFLICT, "stopped", query.dry_run),
    }
}

fn run_response(code: StatusCode, status: &'static str, dry_run: bool) -> Response {
    (code, Json(RunResponse { status, dry_run })).into_response()
}
