//! Secret Storage
//!
//! The control plane never owns a keychain. It reads and writes secrets
//! (the auth token, the current key pair) through the narrow
//! [`SecretStore`] contract. Two implementations ship with the crate:
//!
//! - [`MemorySecretStore`]: process-lifetime storage, used in tests and
//!   when no state directory is configured
//! - [`FileSecretStore`]: a JSON map in the state directory, written
//!   atomically with owner-only permissions

use crate::error::VpnError;
use crate::persist;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Secret store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretStoreError {
    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Delete failed: {0}")]
    Delete(String),
}

/// Keychain-like get/set/delete contract
pub trait SecretStore: Send + Sync {
    fn fetch(&self, key: &str) -> Result<Option<String>, SecretStoreError>;

    fn store(&self, key: &str, value: &str) -> Result<(), SecretStoreError>;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), SecretStoreError>;
}

/// In-memory secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn fetch(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), SecretStoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// File-backed secret store (JSON object, mode 0600)
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SecretStoreError> {
        match persist::read_if_present(&self.path) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| SecretStoreError::Read(e.to_string())),
            Ok(None) => Ok(BTreeMap::new()),
            Err(e) => Err(SecretStoreError::Read(e.to_string())),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        let bytes = serde_json::to_vec_pretty(values)
            .map_err(|e| SecretStoreError::Write(e.to_string()))?;
        persist::write_atomic(&self.path, &bytes)
            .map_err(|e| SecretStoreError::Write(e.to_string()))
    }
}

impl SecretStore for FileSecretStore {
    fn fetch(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), SecretStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()
            .map_err(|e| SecretStoreError::Delete(e.to_string()))?;
        if values.remove(key).is_some() {
            self.save(&values)
                .map_err(|e| SecretStoreError::Delete(e.to_string()))?;
        }
        Ok(())
    }
}

/// Backend auth token
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken([redacted])")
    }
}

const TOKEN_FIELD: &str = "auth-token";

/// Auth token accessor over a [`SecretStore`]
#[derive(Clone)]
pub struct TokenStore {
    secrets: std::sync::Arc<dyn SecretStore>,
}

impl TokenStore {
    pub fn new(secrets: std::sync::Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn fetch_token(&self) -> Result<Option<AuthToken>, VpnError> {
        self.secrets
            .fetch(TOKEN_FIELD)
            .map(|token| token.filter(|t| !t.is_empty()).map(AuthToken))
            .map_err(|e| VpnError::KeychainReadError {
                field: TOKEN_FIELD.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn store_token(&self, token: &AuthToken) -> Result<(), VpnError> {
        self.secrets
            .store(TOKEN_FIELD, token.as_str())
            .map_err(|e| VpnError::KeychainWriteError {
                field: TOKEN_FIELD.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn delete_token(&self) -> Result<(), VpnError> {
        debug!("Deleting stored auth token");
        self.secrets
            .delete(TOKEN_FIELD)
            .map_err(|e| VpnError::KeychainDeleteError {
                field: TOKEN_FIELD.to_string(),
                reason: e.to_string(),
            })
    }
}
