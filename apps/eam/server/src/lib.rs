//! HTTP/WebSocket front end of the eam server.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use eam_core::{
    config::AppConfig, engine::Engine, OperatorEnv, OperatorRegistry, SessionController,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod cli;
pub mod daemon;
pub mod engine;
pub mod hub;
pub mod routes;
pub mod run;
pub mod telemetry;
mod ws;

pub use routes::{build_router, AppState};

/// Wires one operator per configured tasker to a fresh connection hub.
pub fn build_state(config: &AppConfig, engine: Arc<dyn Engine>) -> AppState {
    let env = Arc::new(OperatorEnv::from_config(Arc::clone(&engine), config));
    let registry = Arc::new(OperatorRegistry::from_config(config, env));
    let hub = Arc::new(hub::ConnectionHub::default());
    let controller = Arc::new(SessionController::new(registry, hub.clone()));
    AppState {
        controller,
        hub,
        engine,
        shutdown: CancellationToken::new(),
    }
}

/// Serves until `signal` resolves, then closes open connections and gives
/// live runs up to `grace` to stop.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    signal: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no address")?;
    info!(addr = %local_addr, operators = state.controller.registry().len(), "eam listening");

    let router = build_router(state.clone());
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("server shutdown with error")?;

    state.shutdown.cancel();
    if state.controller.shutdown(grace).await {
        info!("graceful shutdown complete");
    } else {
        warn!(grace_secs = grace.as_secs(), "runs outlived the shutdown grace period");
    }
    Ok(())
}
