//! Session lifecycle management
//!
//! A [`SessionManager`] owns one session's connection handle: it opens
//! the connection through the factory, answers validity queries through
//! the credential store, and tears the handle down exactly once. The
//! [`ActiveSessions`] registry enforces at most one live handle per
//! session key.

pub mod context;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{AuthStateSnapshot, ConnectionFactory, ConnectionHandle};
use crate::credentials::{CredentialMaterial, CredentialStore};
use crate::types::Result;

pub use context::{DeferredCleanup, RequestContext, SingleFire};

/// Settle delay before requesting a pairing code on a fresh connection
pub const PAIR_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Grace for the async credential write after `open`, pairing flow
pub const PAIR_CREDENTIAL_GRACE: Duration = Duration::from_secs(3);
/// Grace for the async credential write after `open`, QR flow
pub const QR_CREDENTIAL_GRACE: Duration = Duration::from_secs(5);
/// How long a freshly paired connection stays usable before teardown
pub const DEFERRED_CLEANUP_DELAY: Duration = Duration::from_secs(30);

/// Session key for the pairing flow: deterministic per E.164 number
pub fn pair_key(e164_digits: &str) -> String {
    format!("pair_{}", e164_digits)
}

/// Session key for the QR flow. A random suffix keeps concurrent
/// requests within the same millisecond from colliding.
pub fn qr_key() -> String {
    format!(
        "qr_{}_{:04x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u16>()
    )
}

/// Whether an externally supplied id is shaped like a session key.
///
/// Keys from [`pair_key`] and [`qr_key`] are a single path-safe token.
/// Anything else, path separators and dot segments included, must never
/// reach the filesystem-backed store.
pub fn valid_session_key(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Live connection handles by session key
pub struct ActiveSessions {
    inner: DashMap<String, Arc<dyn ConnectionHandle>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn take(&self, session_key: &str) -> Option<Arc<dyn ConnectionHandle>> {
        self.inner.remove(session_key).map(|(_, handle)| handle)
    }

    fn insert(&self, session_key: &str, handle: Arc<dyn ConnectionHandle>) {
        self.inner.insert(session_key.to_string(), handle);
    }

    /// Deregister only if the slot still holds this exact handle, so a
    /// late cleanup never evicts a superseding connection.
    fn remove_handle(&self, session_key: &str, handle: &Arc<dyn ConnectionHandle>) {
        self.inner
            .remove_if(session_key, |_, current| Arc::ptr_eq(current, handle));
    }
}

impl Default for ActiveSessions {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one session's connection lifecycle
pub struct SessionManager {
    session_key: String,
    store: Arc<dyn CredentialStore>,
    factory: Arc<dyn ConnectionFactory>,
    active: Arc<ActiveSessions>,
    handle: Mutex<Option<Arc<dyn ConnectionHandle>>>,
}

impl SessionManager {
    pub fn new(
        session_key: String,
        store: Arc<dyn CredentialStore>,
        factory: Arc<dyn ConnectionFactory>,
        active: Arc<ActiveSessions>,
    ) -> Self {
        Self {
            session_key,
            store,
            factory,
            active,
            handle: Mutex::new(None),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Open the connection for this session key.
    ///
    /// Any prior live handle for the same key is closed first; a key
    /// never holds two connections. Factory errors propagate unchanged.
    pub async fn initialize(&self) -> Result<(Arc<dyn ConnectionHandle>, AuthStateSnapshot)> {
        if let Some(prev) = self.active.take(&self.session_key) {
            warn!("Superseding live connection for {}", self.session_key);
            prev.clear_subscriptions();
            prev.close().await;
        }

        let (handle, snapshot) = self.factory.open(&self.session_key).await?;
        self.active.insert(&self.session_key, Arc::clone(&handle));
        *self.handle.lock().await = Some(Arc::clone(&handle));
        debug!(
            "Connection opened for {} (registered: {})",
            self.session_key, snapshot.registered
        );
        Ok((handle, snapshot))
    }

    /// Credential material for this session, if stored and well-formed
    pub async fn get_data(&self) -> Option<CredentialMaterial> {
        match self.store.load(&self.session_key).await {
            Ok(material) => material,
            Err(e) => {
                warn!("Credential read failed for {}: {}", self.session_key, e);
                None
            }
        }
    }

    /// Whether well-formed credential material exists for this session.
    /// The store is the sole source of truth; nothing is cached here.
    pub async fn is_valid(&self) -> bool {
        self.get_data().await.is_some()
    }

    /// Tear down the connection. Idempotent: repeated calls, or a call
    /// before `initialize`, are safe no-ops.
    pub async fn cleanup(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            debug!("Cleaning up session {}", self.session_key);
            handle.clear_subscriptions();
            handle.close().await;
            self.active.remove_handle(&self.session_key, &handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockFactory;
    use crate::credentials::FileCredentialStore;
    use std::sync::atomic::Ordering;

    fn manager_with(factory: Arc<MockFactory>, dir: &std::path::Path, key: &str) -> SessionManager {
        SessionManager::new(
            key.to_string(),
            Arc::new(FileCredentialStore::new(dir)),
            factory,
            Arc::new(ActiveSessions::new()),
        )
    }

    #[test]
    fn test_pair_key_is_deterministic() {
        assert_eq!(pair_key("2348144317152"), "pair_2348144317152");
        assert_eq!(pair_key("2348144317152"), pair_key("2348144317152"));
    }

    #[test]
    fn test_qr_keys_are_unique() {
        let a = qr_key();
        let b = qr_key();
        assert!(a.starts_with("qr_"));
        assert!(b.starts_with("qr_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_key_shape() {
        assert!(valid_session_key("pair_2348144317152"));
        assert!(valid_session_key(&qr_key()));
        assert!(!valid_session_key(""));
        assert!(!valid_session_key("../secret"));
        assert!(!valid_session_key("a/b"));
        assert!(!valid_session_key("pair_123%2F"));
    }

    #[tokio::test]
    async fn test_initialize_registers_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let factory_dyn: Arc<dyn ConnectionFactory> = factory.clone();
        let active = Arc::new(ActiveSessions::new());
        let manager = SessionManager::new(
            "pair_1".into(),
            Arc::new(FileCredentialStore::new(dir.path())),
            factory_dyn,
            Arc::clone(&active),
        );

        let (_, snapshot) = manager.initialize().await.unwrap();
        assert!(!snapshot.registered);
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_supersedes_prior_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let factory_dyn: Arc<dyn ConnectionFactory> = factory.clone();
        let active = Arc::new(ActiveSessions::new());

        let first = SessionManager::new(
            "pair_1".into(),
            Arc::new(FileCredentialStore::new(dir.path())),
            Arc::clone(&factory_dyn),
            Arc::clone(&active),
        );
        first.initialize().await.unwrap();
        let first_conn = factory.last_connection().unwrap();

        let second = SessionManager::new(
            "pair_1".into(),
            Arc::new(FileCredentialStore::new(dir.path())),
            Arc::clone(&factory_dyn),
            Arc::clone(&active),
        );
        second.initialize().await.unwrap();

        assert!(first_conn.is_closed());
        assert_eq!(active.len(), 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_initialize_error_propagates() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        factory.fail_open.store(true, Ordering::SeqCst);
        let manager = manager_with(Arc::clone(&factory), dir.path(), "pair_err");

        let err = match manager.initialize().await {
            Ok(_) => panic!("factory open should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, crate::types::LinkError::ConnectionInit(_)));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager = manager_with(Arc::clone(&factory), dir.path(), "pair_1");

        // Safe before initialize
        manager.cleanup().await;

        manager.initialize().await.unwrap();
        let conn = factory.last_connection().unwrap();

        manager.cleanup().await;
        manager.cleanup().await;
        assert!(conn.is_closed());
        assert_eq!(conn.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_cleanup_keeps_superseding_handle_registered() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let factory_dyn: Arc<dyn ConnectionFactory> = factory.clone();
        let active = Arc::new(ActiveSessions::new());
        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(dir.path()));

        let first = SessionManager::new(
            "pair_1".into(),
            Arc::clone(&store),
            Arc::clone(&factory_dyn),
            Arc::clone(&active),
        );
        first.initialize().await.unwrap();

        let second = SessionManager::new(
            "pair_1".into(),
            store,
            Arc::clone(&factory_dyn),
            Arc::clone(&active),
        );
        second.initialize().await.unwrap();

        // The superseded manager cleaning up late must not evict the new handle
        first.cleanup().await;
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_validity_reads_through_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileCredentialStore::new(dir.path()));
        let store_dyn: Arc<dyn CredentialStore> = store.clone();
        let manager = SessionManager::new(
            "pair_2348144317152".into(),
            store_dyn,
            MockFactory::new(),
            Arc::new(ActiveSessions::new()),
        );

        assert!(!manager.is_valid().await);

        let material = crate::credentials::CredentialMaterial {
            registered: true,
            me: None,
            extra: serde_json::Map::new(),
        };
        store.save("pair_2348144317152", &material).await.unwrap();
        assert!(manager.is_valid().await);
        assert!(manager.get_data().await.unwrap().registered);
    }
}
