/// health.rs – HTTP health and readiness endpoints.
///
/// `/health` is 200 only while the adapter is reachable, the WebSocket is
/// connected, the store answers and trading is not halted; anything else is
/// 503 so the container orchestrator restarts or de-routes us. `/ready`
/// stays 503 until every enabled strategy has finished startup.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::database::Database;
use crate::exchange::ExchangeClient;
use crate::risk::KillSwitch;

#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<Database>,
    pub exchange: Arc<ExchangeClient>,
    pub kill: Arc<KillSwitch>,
    /// Set by the snapshot loop after each successful balance fetch.
    pub adapter_ok: Arc<AtomicBool>,
    /// Set once every enabled strategy completed startup.
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    adapter_connected: bool,
    ws_connected: bool,
    store_reachable: bool,
    halted: bool,
    version: &'static str,
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let adapter_connected = state.adapter_ok.load(Ordering::Relaxed);
    let ws_connected = state.exchange.ws_connected();
    let store_reachable = state.db.get_metadata("health_probe").is_ok();
    let halted = state.kill.is_active();

    let healthy = adapter_connected && ws_connected && store_reachable && !halted;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            adapter_connected,
            ws_connected,
            store_reachable,
            halted,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn ready(State(state): State<HealthState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Serve the health router until the process exits.
pub async fn serve(state: HealthState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
