//! Liveness endpoint

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;

use super::json_response;

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: &'static str,
    /// Seconds since process start
    uptime: u64,
    #[serde(rename = "activeSessions")]
    active_sessions: usize,
    timestamp: String,
}

/// Entry point for `GET /health`
pub fn handle_health(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            healthy: true,
            version: env!("CARGO_PKG_VERSION"),
            uptime: state.started_at.elapsed().as_secs(),
            active_sessions: state.active.len(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    )
}
