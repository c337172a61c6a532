//! Error taxonomy
//!
//! Every failure the control plane can produce funnels into [`VpnError`].
//! Errors that the caller can compensate for (stale cache, server avoidance)
//! are still *fired* through [`ErrorEvents`] so they reach logs and
//! telemetry even when the operation itself succeeds.

use crate::directory::ClientError;
use crate::server_cache::StoreError;
use tokio::sync::mpsc;
use tracing::warn;

/// Control plane errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    // Tunnel configuration errors
    #[error("Server has no registration info (missing allowed IPs)")]
    NoServerRegistrationInfo,

    #[error("Could not get peer public key")]
    CouldNotGetPeerPublicKey,

    #[error("Could not get peer host name")]
    CouldNotGetPeerHostName,

    #[error("Could not get interface address range")]
    CouldNotGetInterfaceAddressRange,

    // Client errors
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Server list returned by the backend is inconsistent")]
    ServerListInconsistency,

    // Server list store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No usable server list found")]
    NoServerListFound,

    // Keychain errors
    #[error("Keychain value for {field} has an unexpected format")]
    FailedToCastKeychainValue { field: String },

    #[error("Keychain read error for {field}: {reason}")]
    KeychainReadError { field: String, reason: String },

    #[error("Keychain write error for {field}: {reason}")]
    KeychainWriteError { field: String, reason: String },

    #[error("Keychain delete error for {field}: {reason}")]
    KeychainDeleteError { field: String, reason: String },

    // Auth errors
    #[error("No auth token found")]
    NoAuthTokenFound,

    #[error("Unhandled error in {function} (line {line}): {source}")]
    Unhandled {
        function: &'static str,
        line: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl VpnError {
    /// Stable identifier used for telemetry
    pub fn code(&self) -> &'static str {
        match self {
            VpnError::NoServerRegistrationInfo => "noServerRegistrationInfo",
            VpnError::CouldNotGetPeerPublicKey => "couldNotGetPeerPublicKey",
            VpnError::CouldNotGetPeerHostName => "couldNotGetPeerHostName",
            VpnError::CouldNotGetInterfaceAddressRange => "couldNotGetInterfaceAddressRange",
            VpnError::Client(e) => e.code(),
            VpnError::ServerListInconsistency => "serverListInconsistency",
            VpnError::Store(e) => e.code(),
            VpnError::NoServerListFound => "noServerListFound",
            VpnError::FailedToCastKeychainValue { .. } => "failedToCastKeychainValueToData",
            VpnError::KeychainReadError { .. } => "keychainReadError",
            VpnError::KeychainWriteError { .. } => "keychainWriteError",
            VpnError::KeychainDeleteError { .. } => "keychainDeleteError",
            VpnError::NoAuthTokenFound => "noAuthTokenFound",
            VpnError::Unhandled { .. } => "unhandledError",
        }
    }

    /// Is this a malformed-server-record error?
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            VpnError::NoServerRegistrationInfo
                | VpnError::CouldNotGetPeerPublicKey
                | VpnError::CouldNotGetPeerHostName
                | VpnError::CouldNotGetInterfaceAddressRange
        )
    }
}

/// Wraps an unexpected error together with the call site.
///
/// ```rust,ignore
/// let err = unhandled!(join_error);
/// ```
#[macro_export]
macro_rules! unhandled {
    ($err:expr) => {
        $crate::VpnError::Unhandled {
            function: module_path!(),
            line: line!(),
            source: ::anyhow::Error::from($err),
        }
    };
}

/// Telemetry payload for a fired error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Stable error code
    pub code: &'static str,
    /// Human readable description
    pub message: String,
}

impl From<&VpnError> for ErrorEvent {
    fn from(error: &VpnError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Error event sink
///
/// Fired errors are always logged; when a telemetry channel is attached
/// they are forwarded there too. Sending never blocks or fails the caller.
#[derive(Debug, Clone, Default)]
pub struct ErrorEvents {
    sink: Option<mpsc::UnboundedSender<ErrorEvent>>,
}

impl ErrorEvents {
    /// Forward fired errors to `sink`
    pub fn new(sink: mpsc::UnboundedSender<ErrorEvent>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Log-only sink
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report an error
    pub fn fire(&self, error: &VpnError) {
        warn!(code = error.code(), "VPN error: {}", error);

        if let Some(ref sink) = self.sink {
            let _ = sink.send(ErrorEvent::from(error));
        }
    }
}
