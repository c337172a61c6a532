//! Daemon Settings
//!
//! Loaded from a TOML file. Every field has a default, so an empty file (or
//! no file at all) yields a working configuration.
//!
//! ```toml
//! directory_url = "https://controller.netp.example.net/"
//! interface_name = "wg-fos"
//! probe_target = "1.1.1.1:443"
//! key_validity_secs = 86400
//! ```

use crate::device_manager::TunnelDefaults;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Daemon configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend base URL
    pub directory_url: String,
    /// Where the key pair, auth token and server cache live
    pub state_dir: PathBuf,
    /// Host message socket
    pub socket_path: PathBuf,
    /// wg-quick interface name
    pub interface_name: String,
    /// TCP endpoint used by the connection tester
    pub probe_target: String,
    /// Port used for latency measurements
    pub latency_port: u16,
    pub test_interval_secs: u64,
    pub latency_interval_secs: u64,
    pub sampling_interval_secs: u64,
    pub listen_port: u16,
    pub dns: Vec<String>,
    /// Overrides the 24h default key lifetime
    pub key_validity_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory_url: "https://controller.netp.example.net/".to_string(),
            state_dir: PathBuf::from("/var/lib/fos-vpn"),
            socket_path: PathBuf::from("/run/fos-vpn.sock"),
            interface_name: "wg-fos".to_string(),
            probe_target: "1.1.1.1:443".to_string(),
            latency_port: 443,
            test_interval_secs: 15,
            latency_interval_secs: 60,
            sampling_interval_secs: 30,
            listen_port: 51821,
            dns: vec!["10.11.12.1".to_string()],
            key_validity_secs: None,
        }
    }
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content)
            .map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn directory_url(&self) -> Result<Url, SettingsError> {
        Url::parse(&self.directory_url).map_err(|e| SettingsError::InvalidValue {
            field: "directory_url",
            reason: e.to_string(),
        })
    }

    pub fn probe_target(&self) -> Result<SocketAddr, SettingsError> {
        self.probe_target.parse().map_err(|_| SettingsError::InvalidValue {
            field: "probe_target",
            reason: format!("{:?} is not an ip:port pair", self.probe_target),
        })
    }

    pub fn tunnel_defaults(&self) -> Result<TunnelDefaults, SettingsError> {
        let dns = self
            .dns
            .iter()
            .map(|server| {
                server.parse::<IpAddr>().map_err(|_| SettingsError::InvalidValue {
                    field: "dns",
                    reason: format!("{:?} is not an IP address", server),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TunnelDefaults {
            listen_port: self.listen_port,
            dns,
        })
    }

    pub fn key_validity(&self) -> Option<Duration> {
        self.key_validity_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            test_interval: Duration::from_secs(self.test_interval_secs.max(1)),
            latency_interval: Duration::from_secs(self.latency_interval_secs.max(1)),
            sampling_interval: Duration::from_secs(self.sampling_interval_secs.max(1)),
            ..SessionConfig::default()
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.state_dir.join("secrets.json")
    }

    pub fn server_cache_file(&self) -> PathBuf {
        self.state_dir.join("servers.json")
    }
}
