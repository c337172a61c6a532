//! Server List Cache
//!
//! Last-known-good server list. Readers get a cheap `Arc` snapshot and never
//! see a half-written list; writers replace the snapshot wholesale. With a
//! backing file the list survives restarts.

use crate::persist;
use crate::server::ServerRecord;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Server list store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to encode server list: {0}")]
    FailedToEncodeServerList(String),

    #[error("Failed to decode server list: {0}")]
    FailedToDecodeServerList(String),

    #[error("Failed to write server list: {0}")]
    FailedToWriteServerList(String),

    #[error("Failed to read server list: {0}")]
    FailedToReadServerList(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::FailedToEncodeServerList(_) => "failedToEncodeServerList",
            StoreError::FailedToDecodeServerList(_) => "failedToDecodeServerList",
            StoreError::FailedToWriteServerList(_) => "failedToWriteServerList",
            StoreError::FailedToReadServerList(_) => "failedToReadServerList",
        }
    }
}

/// Copy-on-write server list snapshot
pub struct ServerListCache {
    snapshot: RwLock<Option<Arc<Vec<ServerRecord>>>>,
    path: Option<PathBuf>,
}

impl ServerListCache {
    /// In-memory cache
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Some(Arc::new(Vec::new()))),
            path: None,
        }
    }

    /// File-backed cache; the file is read lazily on first access
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: RwLock::new(None),
            path: Some(path.into()),
        }
    }

    /// Replace the stored list
    pub fn store(&self, servers: &[ServerRecord]) -> Result<(), StoreError> {
        let servers = Arc::new(servers.to_vec());

        if let Some(ref path) = self.path {
            let bytes = serde_json::to_vec_pretty(servers.as_ref())
                .map_err(|e| StoreError::FailedToEncodeServerList(e.to_string()))?;
            persist::write_atomic(path, &bytes)
                .map_err(|e| StoreError::FailedToWriteServerList(e.to_string()))?;
        }

        debug!("Cached {} servers", servers.len());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(servers);
        Ok(())
    }

    /// Current snapshot (empty when nothing was ever stored)
    pub fn stored_server_list(&self) -> Result<Arc<Vec<ServerRecord>>, StoreError> {
        if let Some(ref snapshot) = *self.snapshot.read().unwrap_or_else(PoisonError::into_inner) {
            return Ok(snapshot.clone());
        }

        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref snapshot) = *slot {
            return Ok(snapshot.clone());
        }

        let loaded = Arc::new(self.load()?);
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    /// Forget the stored list (memory and file)
    pub fn remove_server_list(&self) -> Result<(), StoreError> {
        if let Some(ref path) = self.path {
            persist::remove_if_present(path)
                .map_err(|e| StoreError::FailedToWriteServerList(e.to_string()))?;
        }

        info!("Server list cache cleared");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Vec::new()));
        Ok(())
    }

    fn load(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let Some(ref path) = self.path else {
            return Ok(Vec::new());
        };

        match persist::read_if_present(path) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::FailedToDecodeServerList(e.to_string())),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(StoreError::FailedToReadServerList(e.to_string())),
        }
    }
}
