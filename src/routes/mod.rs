//! HTTP routes for Linkway

pub mod health;
pub mod pair;
pub mod qr;
pub mod status;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::credentials::CredentialMaterial;

pub use health::handle_health;
pub use pair::handle_pair;
pub use qr::handle_qr;
pub use status::handle_session_status;

/// Client-facing summary of a linked session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    pub platform: Option<String>,
    pub registered: bool,
}

impl From<&CredentialMaterial> for SessionSummary {
    fn from(material: &CredentialMaterial) -> Self {
        Self {
            client_id: material.client_id().map(str::to_string),
            platform: material.platform().map(str::to_string),
            registered: material.registered,
        }
    }
}

/// Standard failure body: `{"success": false, "message": ...}`
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

/// Serialize a body as a JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_default()
}

/// JSON failure response with a human-readable message
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorBody {
            success: false,
            message: message.into(),
        },
    )
}
