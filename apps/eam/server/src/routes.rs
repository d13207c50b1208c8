use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use eam_core::{engine::Engine, SessionController};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{hub::ConnectionHub, ws};

pub const PONG: &str = "pong!!!!!";
pub const EAM_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_ID: &str = env!("EAM_BUILD_ID");

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
    pub hub: Arc<ConnectionHub>,
    pub engine: Arc<dyn Engine>,
    /// Cancelled once the listener stops accepting; ends open read loops.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping).post(ping))
        .route("/pid/validate", post(validate_pid))
        .route("/api/versions", get(versions))
        .route("/api/versions/engine", get(engine_version))
        .route("/api/operators", get(operators))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> &'static str {
    PONG
}

#[derive(Debug, Deserialize)]
struct PidQuery {
    pid: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidValidation {
    pub validated: bool,
}

async fn validate_pid(body: axum::body::Bytes) -> impl IntoResponse {
    let query = match serde_json::from_slice::<PidQuery>(&body) {
        Ok(query) if query.pid > 0 => query,
        Ok(query) => {
            debug!(pid = query.pid, "rejecting non-positive pid");
            return (StatusCode::BAD_REQUEST, Json(PidValidation { validated: false }));
        }
        Err(err) => {
            debug!(error = %err, "rejecting malformed pid body");
            return (StatusCode::BAD_REQUEST, Json(PidValidation { validated: false }));
        }
    };
    let validated = u32::try_from(query.pid).is_ok_and(|pid| pid == std::process::id());
    (StatusCode::OK, Json(PidValidation { validated }))
}

async fn versions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "eam": EAM_VERSION,
        "engine": state.engine.version(),
        "build": BUILD_ID,
    }))
}

async fn engine_version(State(state): State<AppState>) -> String {
    state.engine.version()
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorSummary {
    pub id: String,
    pub running: bool,
}

async fn operators(State(state): State<AppState>) -> Json<Vec<OperatorSummary>> {
    let registry = state.controller.registry();
    let mut summaries: Vec<OperatorSummary> = registry
        .handles()
        .into_iter()
        .map(|handle| OperatorSummary {
            id: handle.id().to_string(),
            running: handle.is_running(),
        })
        .collect();
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(summaries)
}
