//! Configuration for Linkway
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Linkway - pairing-code and QR link-session generator
#[derive(Parser, Debug, Clone)]
#[command(name = "linkway")]
#[command(about = "HTTP service that links messaging accounts via pairing code or QR")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Directory holding per-session credential material
    #[arg(long, env = "SESSIONS_DIR", default_value = "./sessions")]
    pub sessions_dir: PathBuf,

    /// WebSocket URL of the remote service's link gateway
    #[arg(long, env = "LINK_GATEWAY_URL", default_value = "ws://localhost:8443/link")]
    pub gateway_url: String,

    /// Seconds to wait for a terminal link transition before responding 408
    #[arg(long, env = "LINK_TIMEOUT_SECONDS", default_value = "120")]
    pub link_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate cross-field constraints before startup
    pub fn validate(&self) -> Result<(), String> {
        if self.link_timeout_secs == 0 {
            return Err("LINK_TIMEOUT_SECONDS must be greater than zero".into());
        }
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            return Err(format!(
                "LINK_GATEWAY_URL must be a ws:// or wss:// URL, got {}",
                self.gateway_url
            ));
        }
        Ok(())
    }
}
