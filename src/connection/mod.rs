//! Connection abstraction for the remote messaging service
//!
//! The underlying protocol is opaque to the rest of the crate: a
//! connection is a live handle that emits state updates, can be asked
//! for a pairing code, and can be closed. The production implementation
//! in [`gateway`] speaks JSON frames over a WebSocket to the remote
//! service's link gateway.

pub mod gateway;
#[cfg(test)]
pub mod mock;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::types::Result;

pub use gateway::GatewayFactory;

/// Connection phase reported by the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

/// One state-change notification from the connection.
///
/// A QR challenge may arrive with or without a phase change, and no
/// ordering is guaranteed between a challenge and the `Open` phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUpdate {
    pub phase: Option<ConnectionPhase>,
    pub qr_challenge: Option<String>,
}

impl ConnectionUpdate {
    pub fn phase(phase: ConnectionPhase) -> Self {
        Self { phase: Some(phase), qr_challenge: None }
    }

    pub fn qr(challenge: impl Into<String>) -> Self {
        Self { phase: None, qr_challenge: Some(challenge.into()) }
    }
}

/// Snapshot of authentication state at connection-open time
#[derive(Debug, Clone, Copy)]
pub struct AuthStateSnapshot {
    /// True when stored credential material already registers this session
    pub registered: bool,
}

/// Identifies one registered update handler, for later unsubscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Wait for a subscription id that is being registered concurrently.
///
/// `subscribe` assigns the id, so the registering task can only fill
/// the slot after the call returns. A handler invoked for an update
/// dispatched in that window waits here instead of skipping its
/// unsubscribe.
pub async fn subscription_id(slot: &OnceLock<SubscriptionId>) -> SubscriptionId {
    loop {
        if let Some(id) = slot.get() {
            return *id;
        }
        tokio::task::yield_now().await;
    }
}

/// Boxed async handler invoked for every connection update.
///
/// Handlers on the same connection run sequentially; a handler that
/// awaits delays dispatch of subsequent updates, never reenters.
pub type UpdateHandler =
    Box<dyn Fn(ConnectionUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// A live, single-owner session connection
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Register a state-update handler
    fn subscribe(&self, handler: UpdateHandler) -> SubscriptionId;

    /// Remove a handler; returns false if it was already removed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Remove every remaining handler
    fn clear_subscriptions(&self);

    /// Ask the remote service for a pairing code for the given E.164 number
    async fn request_pairing_code(&self, msisdn: &str) -> Result<String>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens connections for session keys
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        session_key: &str,
    ) -> Result<(Arc<dyn ConnectionHandle>, AuthStateSnapshot)>;
}
