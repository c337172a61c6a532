//! Key Store
//!
//! Owns the current [`KeyPair`] and its expiration. Key material is created
//! lazily, persisted through a [`SecretStore`] so it survives restarts, and
//! only replaced on expiry or an explicit reset. Re-expiring (when a server
//! lease ends sooner than the local key) keeps the key material.
//!
//! All operations serialize on an internal mutex.

use crate::error::VpnError;
use crate::keys::{KeyPair, PrivateKey};
use crate::secret_store::SecretStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const KEY_PAIR_FIELD: &str = "key-pair";

/// Default lifetime of a freshly generated key pair
pub const DEFAULT_KEY_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted form of a key pair
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    private_key: String,
    expiration_date: DateTime<Utc>,
}

struct KeyStoreState {
    validity: Duration,
}

/// Current key pair holder
pub struct KeyStore {
    secrets: Arc<dyn SecretStore>,
    state: Mutex<KeyStoreState>,
}

impl KeyStore {
    /// Create a key store with the default validity interval
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            state: Mutex::new(KeyStoreState {
                validity: DEFAULT_KEY_VALIDITY,
            }),
        }
    }

    /// Current validity interval for new keys
    pub fn validity_interval(&self) -> Duration {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).validity
    }

    /// Override the validity interval (`None` restores the default)
    ///
    /// Only affects keys generated from now on.
    pub fn set_validity_interval(&self, validity: Option<Duration>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.validity = validity.unwrap_or(DEFAULT_KEY_VALIDITY);
        info!("Key validity interval set to {:?}", state.validity);
    }

    /// Get the current key pair, generating one if absent or expired
    pub fn current_key_pair(&self) -> Result<KeyPair, VpnError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.current_locked(&state)
    }

    fn current_locked(&self, state: &KeyStoreState) -> Result<KeyPair, VpnError> {
        let now = Utc::now();

        if let Some(key_pair) = self.load()? {
            if !key_pair.is_expired_at(now) {
                return Ok(key_pair);
            }
            debug!("Stored key pair expired at {}", key_pair.expiration());
        }

        let expiration = now + to_chrono(state.validity);
        let key_pair = KeyPair::generate(expiration);
        self.save(&key_pair)?;

        info!(
            "Generated new key pair {:?} (expires {})",
            key_pair.public_key(),
            expiration
        );
        Ok(key_pair)
    }

    /// Re-expire the current key pair without changing key material
    pub fn update_current_key_pair(&self, new_expiration: DateTime<Utc>) -> Result<KeyPair, VpnError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current_locked(&state)?;

        let updated = current.with_expiration(new_expiration);
        self.save(&updated)?;

        info!("Key pair expiration moved to {}", new_expiration);
        Ok(updated)
    }

    /// Forget the current key pair; the next request generates fresh keys
    pub fn reset_current_key_pair(&self) -> Result<(), VpnError> {
        let _state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Resetting the current key pair");

        self.secrets
            .delete(KEY_PAIR_FIELD)
            .map_err(|e| VpnError::KeychainDeleteError {
                field: KEY_PAIR_FIELD.to_string(),
                reason: e.to_string(),
            })
    }

    /// Peek at the stored key pair without generating one
    pub fn stored_key_pair(&self) -> Result<Option<KeyPair>, VpnError> {
        let _state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
    }

    /// Is the stored key pair missing or expired?
    pub fn is_current_key_expired(&self) -> Result<bool, VpnError> {
        Ok(self
            .stored_key_pair()?
            .is_none_or(|key_pair| key_pair.is_expired_at(Utc::now())))
    }

    fn load(&self) -> Result<Option<KeyPair>, VpnError> {
        let raw = self.secrets
            .fetch(KEY_PAIR_FIELD)
            .map_err(|e| VpnError::KeychainReadError {
                field: KEY_PAIR_FIELD.to_string(),
                reason: e.to_string(),
            })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let cast_error = || VpnError::FailedToCastKeychainValue {
            field: KEY_PAIR_FIELD.to_string(),
        };
        let stored: StoredKeyPair = serde_json::from_str(&raw).map_err(|_| cast_error())?;
        let private = PrivateKey::from_base64(&stored.private_key).map_err(|_| cast_error())?;

        Ok(Some(KeyPair::from_private(private, stored.expiration_date)))
    }

    fn save(&self, key_pair: &KeyPair) -> Result<(), VpnError> {
        let stored = StoredKeyPair {
            private_key: key_pair.private_key().to_base64(),
            expiration_date: key_pair.expiration(),
        };
        let write_error = |reason: String| VpnError::KeychainWriteError {
            field: KEY_PAIR_FIELD.to_string(),
            reason,
        };

        let raw = serde_json::to_string(&stored).map_err(|e| write_error(e.to_string()))?;
        self.secrets
            .store(KEY_PAIR_FIELD, &raw)
            .map_err(|e| write_error(e.to_string()))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::MemorySecretStore;

    fn key_store() -> (KeyStore, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        (KeyStore::new(secrets.clone()), secrets)
    }

    #[test]
    fn test_lazily_creates_and_reuses() {
        let (store, _) = key_store();

        assert!(store.stored_key_pair().unwrap().is_none());
        assert!(store.is_current_key_expired().unwrap());

        let first = store.current_key_pair().unwrap();
        let second = store.current_key_pair().unwrap();

        assert_eq!(first, second);
        assert!(first.expiration() > Utc::now());
        assert!(!store.is_current_key_expired().unwrap());
    }

    #[test]
    fn test_expired_key_is_rotated() {
        let (store, _) = key_store();
        let original = store.current_key_pair().unwrap();

        store.update_current_key_pair(Utc::now() - chrono::Duration::seconds(1)).unwrap();
        assert!(store.is_current_key_expired().unwrap());

        let rotated = store.current_key_pair().unwrap();
        assert_ne!(rotated.public_key(), original.public_key());
        assert!(rotated.expiration() > Utc::now());
    }

    #[test]
    fn test_update_keeps_key_material() {
        let (store, _) = key_store();
        let original = store.current_key_pair().unwrap();
        let sooner = Utc::now() + chrono::Duration::minutes(5);

        let updated = store.update_current_key_pair(sooner).unwrap();

        assert_eq!(updated.private_key(), original.private_key());
        assert_eq!(updated.expiration(), sooner);
        assert_eq!(store.current_key_pair().unwrap().expiration(), sooner);
    }

    #[test]
    fn test_reset_forces_new_material() {
        let (store, _) = key_store();
        let original = store.current_key_pair().unwrap();

        store.reset_current_key_pair().unwrap();

        assert!(store.stored_key_pair().unwrap().is_none());
        assert_ne!(store.current_key_pair().unwrap().public_key(), original.public_key());
    }

    #[test]
    fn test_validity_override() {
        let (store, _) = key_store();
        store.set_validity_interval(Some(Duration::from_secs(30)));

        let key_pair = store.current_key_pair().unwrap();
        assert!(key_pair.expiration() <= Utc::now() + chrono::Duration::seconds(30));

        store.set_validity_interval(None);
        assert_eq!(store.validity_interval(), DEFAULT_KEY_VALIDITY);
    }

    #[test]
    fn test_survives_restart() {
        let (store, secrets) = key_store();
        let original = store.current_key_pair().unwrap();

        let reopened = KeyStore::new(secrets);
        assert_eq!(reopened.current_key_pair().unwrap(), original);
    }

    #[test]
    fn test_corrupt_value() {
        let (store, secrets) = key_store();
        secrets.store(KEY_PAIR_FIELD, "garbage").unwrap();

        assert!(matches!(
            store.current_key_pair(),
            Err(VpnError::FailedToCastKeychainValue { .. })
        ));
    }
}
