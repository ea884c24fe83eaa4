//! QR-code workflow
//!
//! `GET /qr` opens a fresh session connection and waits for the remote
//! service to emit a QR challenge. Only the first challenge is rendered;
//! the `open` transition leaves the session live (no close), and the
//! link timeout answers 408 if nothing was delivered in time.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use qrcode_generator::QrCodeEcc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::connection::{subscription_id, ConnectionPhase, ConnectionUpdate, SubscriptionId};
use crate::server::AppState;
use crate::session::{
    qr_key, RequestContext, SessionManager, SingleFire, QR_CREDENTIAL_GRACE,
};
use crate::types::{LinkError, Result};

use super::{error_response, json_response};

/// Rendered QR image width/height in pixels
const QR_IMAGE_SIZE: usize = 300;

const INSTRUCTIONS: [&str; 4] = [
    "1. Open the messaging app on your phone",
    "2. Tap Menu -> Linked Devices",
    "3. Tap \"Link a Device\"",
    "4. Scan the QR code above",
];

#[derive(Serialize)]
struct QrSuccess {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr: Option<String>,
    message: &'static str,
    instructions: Vec<&'static str>,
    #[serde(rename = "sessionId")]
    session_id: String,
}

enum QrOutcome {
    Ready(String),
    RenderFailed,
    TimedOut,
}

/// Render a QR challenge as a PNG data URL, high error correction,
/// black on white.
pub(crate) fn render_qr(challenge: &str) -> Result<String> {
    let png = qrcode_generator::to_png_to_vec(challenge, QrCodeEcc::High, QR_IMAGE_SIZE)
        .map_err(|e| LinkError::Render(e.to_string()))?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}

/// Entry point for `GET /qr`
pub async fn handle_qr(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let session_id = qr_key();
    let manager = Arc::new(SessionManager::new(
        session_id.clone(),
        Arc::clone(&state.store),
        Arc::clone(&state.factory),
        Arc::clone(&state.active),
    ));

    let (handle, snapshot) = match manager.initialize().await {
        Ok(pair) => pair,
        Err(e) => {
            error!("QR session error for {}: {}", session_id, e);
            manager.cleanup().await;
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to initialize QR session",
            );
        }
    };

    // A registered key will never be offered a QR challenge; answer now
    // rather than waiting out the timeout.
    if snapshot.registered {
        manager.cleanup().await;
        return json_response(
            StatusCode::OK,
            &QrSuccess {
                success: true,
                qr: None,
                message: "Session already linked",
                instructions: Vec::new(),
                session_id,
            },
        );
    }

    let (ctx, outcome_rx) = RequestContext::<QrOutcome>::new();
    let qr_seen = Arc::new(SingleFire::new());
    let sub_slot: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());

    let handler_ctx = Arc::clone(&ctx);
    let handler_manager = Arc::clone(&manager);
    let handler_handle = Arc::clone(&handle);
    let handler_slot = Arc::clone(&sub_slot);
    let handler_qr_seen = Arc::clone(&qr_seen);
    let sub = handle.subscribe(Box::new(move |update: ConnectionUpdate| {
        let ctx = Arc::clone(&handler_ctx);
        let manager = Arc::clone(&handler_manager);
        let handle = Arc::clone(&handler_handle);
        let slot = Arc::clone(&handler_slot);
        let qr_seen = Arc::clone(&handler_qr_seen);
        let fut: futures_util::future::BoxFuture<'static, ()> = Box::pin(async move {
            // Only the first challenge gets rendered; later rotations on
            // the same connection are ignored.
            if let Some(challenge) = update.qr_challenge {
                if qr_seen.fire() {
                    match render_qr(&challenge) {
                        Ok(data_url) => {
                            ctx.try_deliver(QrOutcome::Ready(data_url));
                        }
                        Err(e) => {
                            error!("QR generation error for {}: {}", manager.session_key(), e);
                            if ctx.try_fire() {
                                ctx.deliver(QrOutcome::RenderFailed);
                                manager.cleanup().await;
                            }
                        }
                    }
                }
            }

            match update.phase {
                Some(ConnectionPhase::Open) => {
                    info!("Connected via QR: {}", manager.session_key());
                    // Credential writes trail the open event
                    tokio::time::sleep(QR_CREDENTIAL_GRACE).await;
                    if manager.get_data().await.is_some() {
                        info!("Session credentials saved for {}", manager.session_key());
                    }
                    // The session stays live; only the listener goes away
                    handle.unsubscribe(subscription_id(&slot).await);
                }
                Some(ConnectionPhase::Close) => {
                    info!("Connection closed: {}", manager.session_key());
                }
                _ => {}
            }
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
            warn!("QR generation timed out for {}", timeout_manager.session_key());
            timeout_ctx.deliver(QrOutcome::TimedOut);
            timeout_manager.cleanup().await;
        }
    });

    match outcome_rx.await {
        Ok(QrOutcome::Ready(qr)) => json_response(
            StatusCode::OK,
            &QrSuccess {
                success: true,
                qr: Some(qr),
                message: "Scan the QR code with your messaging app",
                instructions: INSTRUCTIONS.to_vec(),
                session_id,
            },
        ),
        Ok(QrOutcome::RenderFailed) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate QR code")
        }
        Ok(QrOutcome::TimedOut) => {
            error_response(StatusCode::REQUEST_TIMEOUT, "QR generation timeout")
        }
        Err(_) => {
            error!("QR outcome channel dropped for {}", session_id);
            manager.cleanup().await;
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to initialize QR session",
            )
        }
    }
}
