//! wg-quick Tunnel Adapter
//!
//! Drives a kernel WireGuard interface through the `wg-quick` and `wg`
//! command line tools. Configurations are written next to each other in
//! `config_dir`: `<if>.conf` for wg-quick and `<if>.wg` for `wg syncconf`.

use crate::adapter::{AdapterError, InterfaceHandle, TunnelAdapter};
use crate::bandwidth::ByteCounters;
use crate::config::TunnelConfiguration;
use crate::persist;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Running {
    address: Option<IpAddr>,
}

/// Kernel WireGuard through wg-quick
#[derive(Debug)]
pub struct WgQuickAdapter {
    interface_name: String,
    config_dir: PathBuf,
    running: Mutex<Option<Running>>,
}

impl WgQuickAdapter {
    pub fn new(interface_name: impl Into<String>, config_dir: impl Into<PathBuf>) -> Result<Self, AdapterError> {
        let interface_name = interface_name.into();
        validate_interface_name(&interface_name).map_err(AdapterError::StartFailed)?;

        Ok(Self {
            interface_name,
            config_dir: config_dir.into(),
            running: Mutex::new(None),
        })
    }

    fn quick_config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface_name))
    }

    fn sync_config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.wg", self.interface_name))
    }

    fn running(&self) -> Option<Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_running(&self, running: Option<Running>) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = running;
    }

    async fn up(&self, config: &TunnelConfiguration) -> Result<(), String> {
        let path = self.quick_config_path();
        write_config(&path, &config.to_wg_quick_config())?;
        run("wg-quick", &[OsStr::new("up"), path.as_os_str()]).await?;

        self.set_running(Some(Running {
            address: tunnel_address(config),
        }));
        Ok(())
    }

    async fn down(&self) -> Result<(), String> {
        let path = self.quick_config_path();
        run("wg-quick", &[OsStr::new("down"), path.as_os_str()]).await?;
        self.set_running(None);
        Ok(())
    }
}

#[async_trait]
impl TunnelAdapter for WgQuickAdapter {
    async fn start(&self, config: &TunnelConfiguration) -> Result<(), AdapterError> {
        if self.running().is_some() {
            return Err(AdapterError::InvalidState);
        }

        info!("Bringing up {}", self.interface_name);
        self.up(config).await.map_err(AdapterError::StartFailed)
    }

    async fn update(&self, config: &TunnelConfiguration, reassert: bool) -> Result<(), AdapterError> {
        let Some(running) = self.running() else {
            return Err(AdapterError::InvalidState);
        };

        // syncconf cannot change interface addresses
        if running.address != tunnel_address(config) {
            info!("Tunnel address changed, restarting {}", self.interface_name);
            self.down().await.map_err(AdapterError::UpdateFailed)?;
            return self.up(config).await.map_err(AdapterError::UpdateFailed);
        }

        debug!("Syncing {} configuration (reassert: {})", self.interface_name, reassert);

        write_config(&self.quick_config_path(), &config.to_wg_quick_config())
            .map_err(AdapterError::UpdateFailed)?;

        let sync_path = self.sync_config_path();
        write_config(&sync_path, &config.to_wg_config()).map_err(AdapterError::UpdateFailed)?;

        run(
            "wg",
            &[OsStr::new("syncconf"), OsStr::new(&self.interface_name), sync_path.as_os_str()],
        )
        .await
        .map_err(AdapterError::UpdateFailed)?;

        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        if self.running().is_none() {
            debug!("{} is not running", self.interface_name);
            return Ok(());
        }

        info!("Tearing down {}", self.interface_name);
        let result = self.down().await.map_err(AdapterError::StopFailed);

        for path in [self.quick_config_path(), self.sync_config_path()] {
            if let Err(e) = persist::remove_if_present(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        result
    }

    async fn byte_counters(&self) -> Option<ByteCounters> {
        self.running()?;

        match run("wg", &[OsStr::new("show"), OsStr::new(&self.interface_name), OsStr::new("transfer")]).await {
            Ok(output) => parse_transfer(&output),
            Err(e) => {
                debug!("Reading transfer counters failed: {}", e);
                None
            }
        }
    }

    fn interface(&self) -> Option<InterfaceHandle> {
        self.running().map(|running| InterfaceHandle {
            name: self.interface_name.clone(),
            address: running.address,
        })
    }

    async fn runtime_configuration(&self) -> Option<String> {
        self.running()?;

        run("wg", &[OsStr::new("showconf"), OsStr::new(&self.interface_name)]).await.ok()
    }
}

fn tunnel_address(config: &TunnelConfiguration) -> Option<IpAddr> {
    config.interface.addresses.first().map(|range| range.address)
}

fn write_config(path: &Path, contents: &str) -> Result<(), String> {
    persist::write_atomic(path, contents.as_bytes())
        .map_err(|e| format!("writing {} failed: {}", path.display(), e))
}

async fn run(program: &str, args: &[&OsStr]) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("{} could not be executed: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed ({}): {}", program, output.status, stderr.trim()));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("{} produced non-utf8 output: {}", program, e))
}

/// Sum the per-peer `<key>\t<rx>\t<tx>` lines of `wg show <if> transfer`
fn parse_transfer(output: &str) -> Option<ByteCounters> {
    let mut total = ByteCounters::default();
    let mut peers = 0;

    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.split_whitespace().skip(1);
        let rx = fields.next()?.parse::<u64>().ok()?;
        let tx = fields.next()?.parse::<u64>().ok()?;

        total.rx_bytes = total.rx_bytes.saturating_add(rx);
        total.tx_bytes = total.tx_bytes.saturating_add(tx);
        peers += 1;
    }

    (peers > 0).then_some(total)
}

fn validate_interface_name(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("interface name must not be empty".to_string());
    }
    if value.len() > 15 {
        return Err("interface name must be <= 15 characters".to_string());
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Ok(());
    }
    Err("interface name contains invalid characters".to_string())
}
