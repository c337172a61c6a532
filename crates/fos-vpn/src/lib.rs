//! fOS VPN - WireGuard Control Plane
//!
//! Keeps a device registered with the VPN backend and a WireGuard tunnel
//! healthy: key rotation, server selection with cache fallback, liveness
//! probing with automatic server avoidance, and a host message channel.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    TunnelSessionController                    │
//! │                                                               │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌───────────────┐  │
//! │  │ Connection   │──▶│   session actor  │──▶│ TunnelAdapter │  │
//! │  │ Tester       │   │ (status, epochs) │   │  (wg-quick)   │  │
//! │  └──────────────┘   └────────┬─────────┘   └───────────────┘  │
//! │                              │                                │
//! │                     ┌────────▼─────────┐                      │
//! │                     │  DeviceManager   │                      │
//! │                     └──┬─────┬──────┬──┘                      │
//! │                        │     │      │                         │
//! │                 KeyStore  Directory  ServerListCache          │
//! └────────────────────────────│──────────────────────────────────┘
//!                              ▼ HTTPS
//!                    ┌───────────────────┐
//!                    │  Backend registry │
//!                    └───────────────────┘
//! ```
//!
//! # Features
//!
//! - **Key rotation**: X25519 key pairs with expiry, rotated on idle
//! - **Server avoidance**: A failed probe moves the tunnel elsewhere
//! - **Offline start**: Falls back to the cached server list
//! - **Host messages**: Binary request/response control channel

mod adapter;
mod bandwidth;
mod config;
mod connection_tester;
mod device_manager;
mod directory;
mod error;
mod host_message;
mod http;
mod key_store;
mod keys;
mod latency;
mod options;
mod persist;
mod platform;
mod secret_store;
mod server;
mod server_cache;
mod session;
mod settings;
mod status;
mod wg_quick;

#[cfg(test)]
mod test_support;

pub use adapter::{AdapterError, InterfaceHandle, TunnelAdapter};
pub use bandwidth::{BandwidthAnalyzer, ByteCounters};
pub use config::{
    ConfigError, Endpoint, EndpointHost, InterfaceConfiguration, IpRange, PeerConfiguration,
    TunnelConfiguration,
};
pub use connection_tester::{
    ConnectionTester, ConnectivityProbe, ProbeOutcome, TcpConnectivityProbe, TesterEvent, TesterReport,
};
pub use device_manager::{DeviceManager, ServerSelectionMethod, TunnelDefaults};
pub use directory::{ClientError, DirectoryClient, HttpDirectoryClient};
pub use error::{ErrorEvent, ErrorEvents, VpnError};
pub use host_message::{HostMessage, HostMessageError, HostResponse};
pub use http::{HttpClient, HttpClientConfig, HttpError};
pub use key_store::{KeyStore, DEFAULT_KEY_VALIDITY};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use latency::{LatencyProbe, LatencyReporter, TcpLatencyProbe};
pub use options::{Activation, SelectedServer, StartOptions};
pub use platform::{NoopPlatform, PlatformHooks};
pub use secret_store::{AuthToken, FileSecretStore, MemorySecretStore, SecretStore, SecretStoreError, TokenStore};
pub use server::{ServerAttributes, ServerInfo, ServerRecord};
pub use server_cache::{ServerListCache, StoreError};
pub use session::{SessionConfig, SessionError, SessionHandle, SessionParts, StopReason, TunnelSessionController};
pub use settings::{Settings, SettingsError};
pub use status::{ConnectionStatus, ServerStatusInfo, SessionEvent, StatusChange, StatusPublisher};
pub use wg_quick::WgQuickAdapter;
