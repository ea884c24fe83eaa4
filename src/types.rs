//! Error types for Linkway

use hyper::StatusCode;
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum LinkError {
    /// Bad or missing request input. No session was created yet.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The link gateway transport could not be established
    #[error("connection init failed: {0}")]
    ConnectionInit(String),

    /// The pairing-code request was rejected or the channel dropped
    #[error("pairing code request failed: {0}")]
    Pairing(String),

    /// QR image generation failed
    #[error("QR render failed: {0}")]
    Render(String),

    /// No terminal transition within the link timeout
    #[error("timed out waiting for link")]
    Timeout,

    /// Credential store read/write failure
    #[error("credential store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LinkError {
    /// HTTP status this error surfaces as at the route boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            LinkError::Validation(_) => StatusCode::BAD_REQUEST,
            LinkError::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
