//! HTTP server implementation
//!
//! hyper http1 with TokioIo and a plain dispatch table; route handlers
//! live in [`crate::routes`].

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::Args;
use crate::connection::{ConnectionFactory, GatewayFactory};
use crate::credentials::{file_store, CredentialStore};
use crate::routes::{self, error_response, json_response};
use crate::session::{valid_session_key, ActiveSessions};
use crate::types::Result;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn CredentialStore>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub active: Arc<ActiveSessions>,
    pub started_at: Instant,
}

impl AppState {
    /// Production state: file store plus the WebSocket link gateway
    pub fn new(args: Args) -> Self {
        let store = file_store(&args.sessions_dir);
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(GatewayFactory::new(args.gateway_url.clone(), Arc::clone(&store)));
        Self::with_parts(args, store, factory)
    }

    /// State with injected collaborators, used by tests
    pub fn with_parts(
        args: Args,
        store: Arc<dyn CredentialStore>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            args,
            store,
            factory,
            active: Arc::new(ActiveSessions::new()),
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    endpoints: [&'static str; 4],
}

/// Accept loop; serves until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Listening on {}", state.args.listen);

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let conn_state = Arc::clone(&state);

        tokio::spawn(async move {
            let svc_state = Arc::clone(&conn_state);
            let service = service_fn(move |req| {
                let state = Arc::clone(&svc_state);
                async move { Ok::<_, hyper::Error>(handle_request(req, state).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Dispatch one request to its route handler
pub async fn handle_request<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    debug!("{} {}", method, path);

    match (method, path.as_str()) {
        (Method::GET, "/") => json_response(
            StatusCode::OK,
            &ServiceInfo {
                service: "linkway",
                version: env!("CARGO_PKG_VERSION"),
                endpoints: ["/pair?number=<digits>", "/qr", "/session/:sessionId", "/health"],
            },
        ),
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::handle_health(&state),
        (Method::GET, "/pair") => routes::handle_pair(state, query.as_deref()).await,
        (Method::GET, "/qr") => routes::handle_qr(state).await,
        (Method::GET, p) if p.starts_with("/session/") => {
            let session_id = &p["/session/".len()..];
            if session_id.is_empty() {
                error_response(StatusCode::NOT_FOUND, "Session id is required")
            } else if !valid_session_key(session_id) {
                // Ids go straight into store paths; nothing with
                // separators or dot segments gets that far
                error_response(StatusCode::NOT_FOUND, "Invalid session id")
            } else {
                routes::handle_session_status(state, session_id).await
            }
        }
        (_, p) => error_response(StatusCode::NOT_FOUND, format!("No route for {}", p)),
    }
}
