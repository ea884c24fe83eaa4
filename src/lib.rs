//! Linkway - link-session generator for remote messaging accounts
//!
//! Exposes two HTTP workflows that stand up an outbound session to a
//! remote messaging service and wait for it to authenticate:
//!
//! - **Pairing** (`/pair`): request a pairing code for a phone number
//! - **QR** (`/qr`): surface the service's QR challenge as an image
//!
//! The session lifecycle lives in [`session`]: connection ownership,
//! state-event handling, exactly-once response delivery, and idempotent
//! teardown. The connection itself is opaque (see [`connection`]);
//! credential material is the sole source of session validity
//! ([`credentials`]).

pub mod config;
pub mod connection;
pub mod credentials;
pub mod routes;
pub mod server;
pub mod session;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{LinkError, Result};
