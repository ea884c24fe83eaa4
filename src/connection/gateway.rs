//! WebSocket transport to the remote service's link gateway
//!
//! Maintains one WebSocket per session. A single spawned task owns the
//! socket: outbound frames arrive over an mpsc channel, inbound `state`
//! frames fan out to subscribers, and `credentials` frames are persisted
//! through the credential store as the remote side authenticates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialMaterial, CredentialStore};
use crate::types::{LinkError, Result};

use super::{
    AuthStateSnapshot, ConnectionFactory, ConnectionHandle, ConnectionPhase, ConnectionUpdate,
    SubscriptionId, UpdateHandler,
};

/// How long to wait for the gateway to answer a pairing-code request
const PAIRING_CODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames sent to the gateway
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Init {
        session_key: &'a str,
        credentials: Option<&'a CredentialMaterial>,
    },
    PairingCode {
        msisdn: &'a str,
    },
    Close,
}

/// Frames received from the gateway
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum GatewayEvent {
    State {
        #[serde(default)]
        phase: Option<ConnectionPhase>,
        #[serde(default)]
        qr: Option<String>,
    },
    Credentials {
        material: CredentialMaterial,
    },
    PairingCode {
        code: String,
    },
    PairingCodeError {
        message: String,
    },
}

struct Shared {
    session_key: String,
    subscribers: DashMap<u64, Arc<UpdateHandler>>,
    pending_code: Mutex<Option<oneshot::Sender<Result<String>>>>,
    closed: AtomicBool,
    shutdown: tokio::sync::Notify,
}

impl Shared {
    /// Fan an update out to subscribers, one at a time in registration order
    async fn dispatch(&self, update: ConnectionUpdate) {
        let mut handlers: Vec<(u64, Arc<UpdateHandler>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);
        for (_, handler) in handlers {
            handler(update.clone()).await;
        }
    }

    fn resolve_code(&self, result: Result<String>) {
        let pending = self.pending_code.lock().map(|mut p| p.take()).unwrap_or(None);
        if let Some(tx) = pending {
            let _ = tx.send(result);
        }
    }
}

/// Live gateway connection for one session key
pub struct GatewayConnection {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Message>,
    next_sub: AtomicU64,
}

impl GatewayConnection {
    async fn connect(
        url: &str,
        session_key: &str,
        credentials: Option<CredentialMaterial>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| LinkError::ConnectionInit(format!("gateway connect to {}: {}", url, e)))?;

        let (mut write, read) = ws.split();

        let init = serde_json::to_string(&OutboundFrame::Init {
            session_key,
            credentials: credentials.as_ref(),
        })?;
        write
            .send(Message::Text(init))
            .await
            .map_err(|e| LinkError::ConnectionInit(format!("gateway init frame: {}", e)))?;

        let shared = Arc::new(Shared {
            session_key: session_key.to_string(),
            subscribers: DashMap::new(),
            pending_code: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: tokio::sync::Notify::new(),
        });

        let (out_tx, out_rx) = mpsc::channel::<Message>(64);

        let loop_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            connection_loop(write, read, out_rx, loop_shared, store).await;
        });

        Ok(Self {
            shared,
            out_tx,
            next_sub: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl ConnectionHandle for GatewayConnection {
    fn subscribe(&self, handler: UpdateHandler) -> SubscriptionId {
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.shared.subscribers.insert(id, Arc::new(handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.remove(&id.0).is_some()
    }

    fn clear_subscriptions(&self) {
        self.shared.subscribers.clear();
    }

    async fn request_pairing_code(&self, msisdn: &str) -> Result<String> {
        if self.is_closed() {
            return Err(LinkError::Pairing("connection already closed".into()));
        }

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending_code.lock() {
            *pending = Some(tx);
        }

        let frame = serde_json::to_string(&OutboundFrame::PairingCode { msisdn })?;
        self.out_tx
            .send(Message::Text(frame))
            .await
            .map_err(|_| LinkError::Pairing("gateway connection lost".into()))?;

        match timeout(PAIRING_CODE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Pairing("pairing channel closed".into())),
            Err(_) => Err(LinkError::Pairing("pairing code request timed out".into())),
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing gateway connection for {}", self.shared.session_key);

        if let Ok(frame) = serde_json::to_string(&OutboundFrame::Close) {
            // Best effort; the gateway may already be gone
            let _ = timeout(Duration::from_secs(1), self.out_tx.send(Message::Text(frame))).await;
        }

        self.shared.subscribers.clear();
        self.shared
            .resolve_code(Err(LinkError::Pairing("connection closed".into())));
        self.shared.shutdown.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

async fn connection_loop<W, R>(
    mut write: W,
    mut read: R,
    mut out_rx: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    store: Arc<dyn CredentialStore>,
) where
    W: futures_util::Sink<Message> + Unpin,
    <W as futures_util::Sink<Message>>::Error: std::fmt::Display,
    R: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            outbound = out_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            warn!("Gateway write failed for {}: {}", shared.session_key, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&shared, &store, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Gateway socket closed for {}", shared.session_key);
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary, nothing to do
                    Some(Err(e)) => {
                        warn!("Gateway read error for {}: {}", shared.session_key, e);
                        break;
                    }
                }
            }
        }
    }

    if !shared.closed.load(Ordering::SeqCst) {
        shared
            .dispatch(ConnectionUpdate::phase(ConnectionPhase::Close))
            .await;
    }
    shared.resolve_code(Err(LinkError::Pairing("gateway connection lost".into())));
}

async fn handle_frame(shared: &Arc<Shared>, store: &Arc<dyn CredentialStore>, text: &str) {
    let event: GatewayEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Unrecognized gateway frame for {}: {}", shared.session_key, e);
            return;
        }
    };

    match event {
        GatewayEvent::State { phase, qr } => {
            shared
                .dispatch(ConnectionUpdate { phase, qr_challenge: qr })
                .await;
        }
        GatewayEvent::Credentials { material } => {
            if let Err(e) = store.save(&shared.session_key, &material).await {
                error!("Failed to persist credentials for {}: {}", shared.session_key, e);
            } else {
                info!("Credentials updated for {}", shared.session_key);
            }
        }
        GatewayEvent::PairingCode { code } => {
            shared.resolve_code(Ok(code));
        }
        GatewayEvent::PairingCodeError { message } => {
            shared.resolve_code(Err(LinkError::Pairing(message)));
        }
    }
}

/// Opens gateway connections, seeding each with stored credentials
pub struct GatewayFactory {
    url: String,
    store: Arc<dyn CredentialStore>,
}

impl GatewayFactory {
    pub fn new(url: impl Into<String>, store: Arc<dyn CredentialStore>) -> Self {
        Self { url: url.into(), store }
    }
}

#[async_trait]
impl ConnectionFactory for GatewayFactory {
    async fn open(
        &self,
        session_key: &str,
    ) -> Result<(Arc<dyn ConnectionHandle>, AuthStateSnapshot)> {
        let material = self
            .store
            .load(session_key)
            .await
            .map_err(|e| LinkError::ConnectionInit(e.to_string()))?;
        let registered = material.as_ref().map(|m| m.registered).unwrap_or(false);

        let conn = GatewayConnection::connect(
            &self.url,
            session_key,
            material,
            Arc::clone(&self.store),
        )
        .await?;

        Ok((Arc::new(conn), AuthStateSnapshot { registered }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_frame_parsing() {
        let state: GatewayEvent =
            serde_json::from_str(r#"{"event":"state","phase":"open"}"#).unwrap();
        assert!(matches!(
            state,
            GatewayEvent::State { phase: Some(ConnectionPhase::Open), qr: None }
        ));

        let qr: GatewayEvent =
            serde_json::from_str(r#"{"event":"state","qr":"2@abcdef"}"#).unwrap();
        assert!(matches!(
            qr,
            GatewayEvent::State { phase: None, qr: Some(ref c) } if c == "2@abcdef"
        ));

        let code: GatewayEvent =
            serde_json::from_str(r#"{"event":"pairing_code","code":"ABCD1234"}"#).unwrap();
        assert!(matches!(code, GatewayEvent::PairingCode { ref code } if code == "ABCD1234"));
    }

    #[test]
    fn test_outbound_frame_shape() {
        let frame = serde_json::to_value(&OutboundFrame::PairingCode { msisdn: "2348144317152" })
            .unwrap();
        assert_eq!(frame["op"], "pairing_code");
        assert_eq!(frame["msisdn"], "2348144317152");

        let init = serde_json::to_value(&OutboundFrame::Init {
            session_key: "pair_2348144317152",
            credentials: None,
        })
        .unwrap();
        assert_eq!(init["op"], "init");
        assert!(init["credentials"].is_null());
    }
}
