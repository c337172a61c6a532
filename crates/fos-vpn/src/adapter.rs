//! Tunnel Adapter Boundary
//!
//! The OS-level tunnel primitive. The session controller starts, updates and
//! stops it with fully built configurations and polls it for byte counters.

use crate::bandwidth::ByteCounters;
use crate::config::TunnelConfiguration;
use async_trait::async_trait;
use std::net::IpAddr;

/// Live tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    /// Interface name (e.g. `wg0`)
    pub name: String,
    /// Tunnel-side address, used to bind probes to the tunnel
    pub address: Option<IpAddr>,
}

/// Adapter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Starting tunnel failed: {0}")]
    StartFailed(String),

    #[error("Updating tunnel failed: {0}")]
    UpdateFailed(String),

    #[error("Stopping tunnel failed: {0}")]
    StopFailed(String),

    #[error("Adapter is in an invalid state")]
    InvalidState,
}

/// OS tunnel primitive
#[async_trait]
pub trait TunnelAdapter: Send + Sync {
    /// Bring the tunnel up
    async fn start(&self, config: &TunnelConfiguration) -> Result<(), AdapterError>;

    /// Apply a new configuration to the running tunnel
    ///
    /// With `reassert` the platform may briefly report the tunnel as
    /// reconnecting; without it the swap is silent.
    async fn update(&self, config: &TunnelConfiguration, reassert: bool) -> Result<(), AdapterError>;

    /// Tear the tunnel down
    async fn stop(&self) -> Result<(), AdapterError>;

    /// Cumulative (rx, tx) byte counters, if available
    async fn byte_counters(&self) -> Option<ByteCounters>;

    /// The live interface, if the tunnel is up
    fn interface(&self) -> Option<InterfaceHandle>;

    /// Runtime configuration text (`wg setconf` form)
    async fn runtime_configuration(&self) -> Option<String>;
}
