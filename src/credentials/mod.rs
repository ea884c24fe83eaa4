//! Credential storage
//!
//! One credential blob per session key, written by the connection as
//! authentication progresses and read back by the lifecycle manager.
//! Presence of well-formed material is the sole source of truth for
//! session validity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{LinkError, Result};

/// Identity of the linked client, as reported by the remote service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Authentication material for one session key.
///
/// Only `registered` and `me` are interpreted here; everything else the
/// gateway hands us is carried opaquely so it survives a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialMaterial {
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<ClientIdentity>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CredentialMaterial {
    pub fn client_id(&self) -> Option<&str> {
        self.me.as_ref().map(|m| m.id.as_str())
    }

    pub fn platform(&self) -> Option<&str> {
        self.me.as_ref().and_then(|m| m.platform.as_deref())
    }
}

/// Durable store of credential material keyed by session key
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether any material exists for the key (well-formed or not)
    async fn exists(&self, session_key: &str) -> bool;

    /// Load material for the key; `Ok(None)` when nothing is stored
    async fn load(&self, session_key: &str) -> Result<Option<CredentialMaterial>>;

    /// Persist material for the key, replacing any prior blob
    async fn save(&self, session_key: &str, material: &CredentialMaterial) -> Result<()>;

    /// Remove all material for the key; missing material is not an error
    async fn remove(&self, session_key: &str) -> Result<()>;
}

/// File-backed store: `<sessions_dir>/<session_key>/creds.json`
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn creds_path(&self, session_key: &str) -> PathBuf {
        self.root.join(session_key).join("creds.json")
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn exists(&self, session_key: &str) -> bool {
        tokio::fs::try_exists(self.creds_path(session_key))
            .await
            .unwrap_or(false)
    }

    async fn load(&self, session_key: &str) -> Result<Option<CredentialMaterial>> {
        let path = self.creds_path(session_key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let material = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Malformed credential material at {}: {}", path.display(), e);
            LinkError::Store(format!("malformed credentials for {}: {}", session_key, e))
        })?;
        Ok(Some(material))
    }

    async fn save(&self, session_key: &str, material: &CredentialMaterial) -> Result<()> {
        let path = self.creds_path(session_key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let bytes = serde_json::to_vec_pretty(material)?;
        tokio::fs::write(&path, bytes).await?;
        debug!("Persisted credentials for {}", session_key);
        Ok(())
    }

    async fn remove(&self, session_key: &str) -> Result<()> {
        let dir = self.root.join(session_key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ensure the sessions root exists at boot
pub async fn ensure_sessions_dir(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root).await?;
    Ok(())
}

/// Convenience constructor used by the server bootstrap
pub fn file_store(root: impl Into<PathBuf>) -> Arc<dyn CredentialStore> {
    Arc::new(FileCredentialStore::new(root))
}
