//! Platform hooks for the system on-demand rule.

use async_trait::async_trait;
use tracing::info;

/// Requests the session makes to the surrounding platform
#[async_trait]
pub trait PlatformHooks: Send + Sync {
    /// Called after a successful start that did not come from on-demand
    async fn enable_on_demand(&self);

    /// Called when an on-demand start fails or the user stops the tunnel
    async fn disable_on_demand(&self);
}

/// Platform without an on-demand rule
#[derive(Debug, Default)]
pub struct NoopPlatform;

#[async_trait]
impl PlatformHooks for NoopPlatform {
    async fn enable_on_demand(&self) {
        info!("On-demand not supported on this platform, ignoring enable request");
    }

    async fn disable_on_demand(&self) {
        info!("On-demand not supported on this platform, ignoring disable request");
    }
}
