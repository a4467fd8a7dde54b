//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::network::HealthState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub state: &'static str,
    pub connections: usize,
    pub messages_received: u64,
    pub in_flight: u64,
    pub uptime_secs: u64,
}

/// Always 200; `state` tells "up but draining" apart from "ready".
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    let stats = state.registry.stats();
    Json(HealthReport {
        name: state.server.name.clone(),
        state: state.shutdown.health_state().as_str(),
        connections: stats.connections,
        messages_received: stats.messages_received,
        in_flight: state.shutdown.in_flight_count(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Liveness probe: 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 when ready, 503 while starting, draining, or stopped.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
