//! Server Records
//!
//! Wire model of the backend server list. Field names follow the backend's
//! camelCase JSON; timestamps are RFC 3339.

use crate::config::Endpoint;
use crate::keys::PublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Location attributes of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAttributes {
    pub city: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub timezone_offset: i32,
}

/// A VPN server as advertised by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub attributes: ServerAttributes,
    /// Server public key (base64)
    pub public_key: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    pub port: u16,
}

impl ServerInfo {
    /// "City, CC"
    pub fn location(&self) -> String {
        format!("{}, {}", self.attributes.city, self.attributes.country.to_uppercase())
    }

    /// First IP, else first hostname, plus port
    pub fn endpoint(&self) -> Option<Endpoint> {
        if let Some(ip) = self.ips.iter().find_map(|ip| ip.parse::<IpAddr>().ok()) {
            return Some(Endpoint::ip(ip, self.port));
        }

        self.hostnames
            .iter()
            .find(|hostname| !hostname.is_empty())
            .map(|hostname| Endpoint::name(hostname.clone(), self.port))
    }

    /// First IPv4 address, if any
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|ip| ip.parse::<Ipv4Addr>().ok())
    }
}

/// A server plus this device's registration state with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Client public keys (base64) registered with this server
    #[serde(default)]
    pub registered_public_keys: Vec<String>,
    /// Tunnel address ranges assigned to this device
    #[serde(default, rename = "allowedIPs", skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    /// When the registration lease ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub server: ServerInfo,
}

impl ServerRecord {
    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub fn location(&self) -> String {
        self.server.location()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.server.endpoint()
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.server.ipv4()
    }

    /// Does the record list `public_key` among its registered keys?
    pub fn is_registered_with(&self, public_key: &PublicKey) -> bool {
        let encoded = public_key.to_base64();
        self.registered_public_keys.iter().any(|key| *key == encoded)
    }
}

/// Drop records whose name was already seen, keeping backend order
pub fn dedupe_by_name(servers: Vec<ServerRecord>) -> Vec<ServerRecord> {
    let mut seen = HashSet::new();
    servers
        .into_iter()
        .filter(|record| seen.insert(record.server.name.clone()))
        .collect()
}
