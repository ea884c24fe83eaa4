//! Session status lookup
//!
//! `GET /session/:sessionId` reports store-backed validity. Always 200;
//! the body's `success` flag carries the answer.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;
use crate::session::SessionManager;

use super::{json_response, SessionSummary};

#[derive(Serialize)]
struct StatusBody {
    success: bool,
    message: &'static str,
    #[serde(rename = "sessionData", skip_serializing_if = "Option::is_none")]
    session_data: Option<SessionSummary>,
}

/// Entry point for `GET /session/:sessionId`
pub async fn handle_session_status(state: Arc<AppState>, session_id: &str) -> Response<Full<Bytes>> {
    let manager = SessionManager::new(
        session_id.to_string(),
        Arc::clone(&state.store),
        Arc::clone(&state.factory),
        Arc::clone(&state.active),
    );

    if manager.is_valid().await {
        let session_data = manager.get_data().await.as_ref().map(SessionSummary::from);
        json_response(
            StatusCode::OK,
            &StatusBody {
                success: true,
                message: "Session is valid",
                session_data,
            },
        )
    } else {
        json_response(
            StatusCode::OK,
            &StatusBody {
                success: false,
                message: "Session not found or invalid",
                session_data: None,
            },
        )
    }
}
