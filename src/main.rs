//! Linkway - link-session generator

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linkway::{config::Args, credentials, server, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("linkway={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Linkway - session link generator");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Sessions dir: {}", args.sessions_dir.display());
    info!("Link gateway: {}", args.gateway_url);
    info!("Link timeout: {}s", args.link_timeout_secs);
    info!("======================================");

    credentials::ensure_sessions_dir(&args.sessions_dir).await?;

    let state = Arc::new(AppState::new(args));
    server::run(state).await?;

    Ok(())
}
