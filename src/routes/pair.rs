//! Pairing-code workflow
//!
//! `GET /pair?number=<intl digits>` opens a session connection, requests
//! a pairing code for the number, and waits for the `open` transition or
//! the link timeout. The open handler and the timeout race to the
//! request latch; whichever wins sends the one and only response.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use phonenumber::Mode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::connection::{subscription_id, ConnectionPhase, ConnectionUpdate, SubscriptionId};
use crate::server::AppState;
use crate::session::{
    pair_key, DeferredCleanup, RequestContext, SessionManager, DEFERRED_CLEANUP_DELAY,
    PAIR_CREDENTIAL_GRACE, PAIR_SETTLE_DELAY,
};
use crate::types::{LinkError, Result};

use super::{error_response, json_response, SessionSummary};

const INVALID_NUMBER_MSG: &str =
    "Invalid phone number format. Please use full international number without + (e.g., 2348144317152)";
const PAIRING_FAILED_MSG: &str = "Failed to generate pairing code. Please try again.";

#[derive(Deserialize)]
struct PairQuery {
    number: Option<String>,
}

#[derive(Serialize)]
struct PairSuccess {
    success: bool,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(rename = "sessionData")]
    session_data: Option<SessionSummary>,
}

enum PairOutcome {
    Linked(Option<SessionSummary>),
    TimedOut,
}

/// Normalize to digits, validate as an international number, and return
/// the E.164 digits (no leading `+`).
fn validate_number(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(LinkError::Validation(INVALID_NUMBER_MSG.into()));
    }
    let parsed = phonenumber::parse(None, format!("+{}", digits))
        .map_err(|_| LinkError::Validation(INVALID_NUMBER_MSG.into()))?;
    if !phonenumber::is_valid(&parsed) {
        return Err(LinkError::Validation(INVALID_NUMBER_MSG.into()));
    }
    let e164 = parsed.format().mode(Mode::E164).to_string();
    Ok(e164.trim_start_matches('+').to_string())
}

/// Entry point for `GET /pair`
pub async fn handle_pair(state: Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let parsed: PairQuery = match serde_urlencoded::from_str(query.unwrap_or("")) {
        Ok(q) => q,
        Err(_) => PairQuery { number: None },
    };

    let number = match parsed.number.filter(|n| !n.is_empty()) {
        Some(number) => number,
        None => {
            return error_response(StatusCode::BAD_REQUEST, "Phone number is required");
        }
    };

    let e164 = match validate_number(&number) {
        Ok(e164) => e164,
        Err(LinkError::Validation(msg)) => {
            return error_response(StatusCode::BAD_REQUEST, msg);
        }
        Err(e) => return error_response(e.status_code(), e.to_string()),
    };

    run_pair_workflow(state, e164).await
}

async fn run_pair_workflow(state: Arc<AppState>, e164: String) -> Response<Full<Bytes>> {
    let manager = Arc::new(SessionManager::new(
        pair_key(&e164),
        Arc::clone(&state.store),
        Arc::clone(&state.factory),
        Arc::clone(&state.active),
    ));

    let (handle, snapshot) = match manager.initialize().await {
        Ok(pair) => pair,
        Err(e) => {
            error!("Pairing init error for {}: {}", manager.session_key(), e);
            manager.cleanup().await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, PAIRING_FAILED_MSG);
        }
    };

    // Already-linked sessions need no pairing code; answer from the store
    // instead of requesting a new challenge.
    if snapshot.registered {
        let summary = manager.get_data().await.as_ref().map(SessionSummary::from);
        manager.cleanup().await;
        return json_response(
            StatusCode::OK,
            &PairSuccess {
                success: true,
                message: "Session already linked",
                code: None,
                session_data: summary,
            },
        );
    }

    tokio::time::sleep(PAIR_SETTLE_DELAY).await;

    let code = match handle.request_pairing_code(&e164).await {
        Ok(code) => code,
        Err(e) => {
            error!("Pairing error for {}: {}", manager.session_key(), e);
            manager.cleanup().await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, PAIRING_FAILED_MSG);
        }
    };
    let formatted = format_pairing_code(&code);
    info!("Pairing code requested for {}", e164);

    let (ctx, outcome_rx) = RequestContext::<PairOutcome>::new();
    let sub_slot: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());

    let handler_ctx = Arc::clone(&ctx);
    let handler_manager = Arc::clone(&manager);
    let handler_handle = Arc::clone(&handle);
    let handler_slot = Arc::clone(&sub_slot);
    let sub = handle.subscribe(Box::new(move |update: ConnectionUpdate| {
        let ctx = Arc::clone(&handler_ctx);
        let manager = Arc::clone(&handler_manager);
        let handle = Arc::clone(&handler_handle);
        let slot = Arc::clone(&handler_slot);
        let fut: futures_util::future::BoxFuture<'static, ()> = Box::pin(async move {
            if update.phase != Some(ConnectionPhase::Open) {
                return;
            }
            if !ctx.try_fire() {
                return;
            }
            info!("Successfully connected: {}", manager.session_key());
            handle.unsubscribe(subscription_id(&slot).await);

            // Credential writes trail the open event; give the store a moment
            tokio::time::sleep(PAIR_CREDENTIAL_GRACE).await;
            let summary = manager.get_data().await.as_ref().map(SessionSummary::from);
            ctx.deliver(PairOutcome::Linked(summary));

            // Leave the fresh session usable before reclaiming it
            DeferredCleanup::schedule(manager, DEFERRED_CLEANUP_DELAY);
        });
        fut
    }));
    let _ = sub_slot.set(sub);

    let timeout_ctx = Arc::clone(&ctx);
    let timeout_manager = Arc::clone(&manager);
    let timeout = Duration::from_secs(state.args.link_timeout_secs);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if timeout_ctx.try_fire() {
            warn!("Pairing timed out for {}", timeout_manager.session_key());
            timeout_ctx.deliver(PairOutcome::TimedOut);
            timeout_manager.cleanup().await;
        }
    });

    match outcome_rx.await {
        Ok(PairOutcome::Linked(session_data)) => {
            let message = if session_data.is_some() {
                "Session created successfully!"
            } else {
                "Pairing code generated! Approve the link on your device."
            };
            json_response(
                StatusCode::OK,
                &PairSuccess {
                    success: true,
                    message,
                    code: Some(formatted),
                    session_data,
                },
            )
        }
        Ok(PairOutcome::TimedOut) => {
            error_response(StatusCode::REQUEST_TIMEOUT, "Pairing timeout. Please try again.")
        }
        Err(_) => {
            error!("Pairing outcome channel dropped for {}", manager.session_key());
            manager.cleanup().await;
            error_response(StatusCode::INTERNAL_SERVER_ERROR, PAIRING_FAILED_MSG)
        }
    }
}

/// `ABCD1234EFGH` -> `ABCD-1234-EFGH`
fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
