//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use capbroker_core::EngineStats;
use serde::Serialize;

use super::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub state: &'static str,
    pub connections: usize,
    pub in_flight: u64,
    pub uptime_secs: u64,
    pub broker: BrokerReport,
}

/// Routing engine sizes at the time of the check.
#[derive(Debug, Serialize)]
pub struct BrokerReport {
    pub providers: usize,
    pub pending_correlations: usize,
    pub provider_connections: usize,
    pub consumer_connections: usize,
}

impl From<EngineStats> for BrokerReport {
    fn from(stats: EngineStats) -> Self {
        Self {
            providers: stats.providers,
            pending_correlations: stats.pending_correlations,
            provider_connections: stats.provider_connections,
            consumer_connections: stats.consumer_connections,
        }
    }
}

/// Always 200; `state` tells a draining server apart from a ready one.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        state: state.shutdown.health_state().as_str(),
        connections: state.registry.count(),
        in_flight: state.shutdown.in_flight_count(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        broker: state.engine.stats().into(),
    })
}

/// 200 while the process is up.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 only while new sessions are accepted, 503 before Ready and once
/// draining starts.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state().is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
