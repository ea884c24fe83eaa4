//! Scriptable in-memory connection for workflow tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{LinkError, Result};

use super::{
    AuthStateSnapshot, ConnectionFactory, ConnectionHandle, ConnectionUpdate, SubscriptionId,
    UpdateHandler,
};

#[derive(Default)]
pub struct MockConnection {
    subscribers: DashMap<u64, Arc<UpdateHandler>>,
    next_sub: AtomicU64,
    pub pairing_code: Mutex<String>,
    pub fail_pairing: AtomicBool,
    pub code_requests: AtomicUsize,
    closed: AtomicBool,
    pub close_count: AtomicUsize,
}

impl MockConnection {
    pub fn new(pairing_code: &str) -> Arc<Self> {
        let conn = Self::default();
        *conn.pairing_code.lock().unwrap() = pairing_code.to_string();
        Arc::new(conn)
    }

    /// Drive one update through all current subscribers, sequentially
    pub async fn emit(&self, update: ConnectionUpdate) {
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

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl ConnectionHandle for MockConnection {
    fn subscribe(&self, handler: UpdateHandler) -> SubscriptionId {
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, Arc::new(handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id.0).is_some()
    }

    fn clear_subscriptions(&self) {
        self.subscribers.clear();
    }

    async fn request_pairing_code(&self, _msisdn: &str) -> Result<String> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_pairing.load(Ordering::SeqCst) {
            return Err(LinkError::Pairing("mock pairing failure".into()));
        }
        Ok(self.pairing_code.lock().unwrap().clone())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out [`MockConnection`]s and remembering the last one
#[derive(Default)]
pub struct MockFactory {
    pub registered: AtomicBool,
    pub fail_open: AtomicBool,
    pub pairing_code: Mutex<String>,
    pub opened: AtomicUsize,
    pub last: Mutex<Option<Arc<MockConnection>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        let factory = Self::default();
        *factory.pairing_code.lock().unwrap() = "ABCD1234EFGH".to_string();
        Arc::new(factory)
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn open(
        &self,
        _session_key: &str,
    ) -> Result<(Arc<dyn ConnectionHandle>, AuthStateSnapshot)> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionInit("mock transport refused".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let conn = MockConnection::new(&self.pairing_code.lock().unwrap());
        *self.last.lock().unwrap() = Some(Arc::clone(&conn));
        let snapshot = AuthStateSnapshot {
            registered: self.registered.load(Ordering::SeqCst),
        };
        Ok((conn, snapshot))
    }
}
