//! Tunnel Configuration
//!
//! Interface + peer description handed to the tunnel adapter. A
//! configuration is built fresh for every (re)configuration and never
//! mutated in place. It renders to the `wg-quick` file format and to the
//! reduced `wg setconf` format.

use crate::keys::{PrivateKey, PublicKey};
use std::fmt::{self, Write as _};
use std::net::IpAddr;
use std::str::FromStr;

/// Endpoint host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointHost {
    Ip(IpAddr),
    Name(String),
}

/// Network endpoint (host + UDP port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: EndpointHost,
    pub port: u16,
}

impl Endpoint {
    /// Endpoint from an IP address
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: EndpointHost::Ip(addr),
            port,
        }
    }

    /// Endpoint from a host name
    pub fn name(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: EndpointHost::Name(name.into()),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            EndpointHost::Ip(IpAddr::V6(addr)) => write!(f, "[{}]:{}", addr, self.port),
            EndpointHost::Ip(addr) => write!(f, "{}:{}", addr, self.port),
            EndpointHost::Name(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// CIDR address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub address: IpAddr,
    pub prefix: u8,
}

impl IpRange {
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ConfigError::InvalidPrefix(prefix));
        }
        Ok(Self { address, prefix })
    }

    /// Everything (`0.0.0.0/0` or `::/0`)
    pub fn any_v4() -> Self {
        Self {
            address: IpAddr::from([0u8; 4]),
            prefix: 0,
        }
    }

    pub fn any_v6() -> Self {
        Self {
            address: IpAddr::from([0u16; 8]),
            prefix: 0,
        }
    }
}

impl FromStr for IpRange {
    type Err = ConfigError;

    /// Parse CIDR notation; a bare address is a host route
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let address: IpAddr = addr.parse()
            .map_err(|_| ConfigError::InvalidRange(s.to_string()))?;
        let prefix = match prefix {
            Some(prefix) => prefix.parse()
                .map_err(|_| ConfigError::InvalidRange(s.to_string()))?,
            None if address.is_ipv4() => 32,
            None => 128,
        };

        Self::new(address, prefix)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Local interface section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfiguration {
    pub private_key: PrivateKey,
    pub listen_port: Option<u16>,
    pub dns: Vec<IpAddr>,
    pub addresses: Vec<IpRange>,
}

/// Peer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfiguration {
    pub public_key: PublicKey,
    pub endpoint: Option<Endpoint>,
    pub allowed_ips: Vec<IpRange>,
    /// Persistent keepalive interval (seconds)
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfiguration {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfiguration {
    pub name: Option<String>,
    pub interface: InterfaceConfiguration,
    pub peers: Vec<PeerConfiguration>,
}

impl TunnelConfiguration {
    /// Render as a `wg-quick` configuration file
    pub fn to_wg_quick_config(&self) -> String {
        let mut out = String::from("[Interface]\n");
        let interface = &self.interface;

        let _ = writeln!(out, "PrivateKey = {}", interface.private_key.to_base64());
        if let Some(port) = interface.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if !interface.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", join(&interface.addresses));
        }
        if !interface.dns.is_empty() {
            let _ = writeln!(out, "DNS = {}", join(&interface.dns));
        }

        self.write_peers(&mut out);
        out
    }

    /// Render as a `wg setconf` configuration (no Address/DNS lines)
    pub fn to_wg_config(&self) -> String {
        let mut out = String::from("[Interface]\n");

        let _ = writeln!(out, "PrivateKey = {}", self.interface.private_key.to_base64());
        if let Some(port) = self.interface.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }

        self.write_peers(&mut out);
        out
    }

    fn write_peers(&self, out: &mut String) {
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key.to_base64());
            if let Some(ref endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if !peer.allowed_ips.is_empty() {
                let _ = writeln!(out, "AllowedIPs = {}", join(&peer.allowed_ips));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(u8),
}
