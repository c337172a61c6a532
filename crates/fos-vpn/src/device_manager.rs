//! Device Manager
//!
//! Turns "connect me somewhere" into a concrete [`TunnelConfiguration`]:
//! fetches the auth token, registers the current public key with the
//! backend, picks a server according to the selection policy and falls back
//! to the cached server list when the backend cannot be reached.
//!
//! All operations are serialized on an async mutex.

use crate::config::{InterfaceConfiguration, IpRange, PeerConfiguration, TunnelConfiguration};
use crate::directory::{ClientError, DirectoryClient};
use crate::error::{ErrorEvents, VpnError};
use crate::key_store::KeyStore;
use crate::keys::{KeyPair, PublicKey};
use crate::secret_store::{AuthToken, TokenStore};
use crate::server::{ServerInfo, ServerRecord};
use crate::server_cache::ServerListCache;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How to pick the server to register with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelectionMethod {
    /// Let the backend decide
    Automatic,
    /// Register with this server
    PreferredServer(String),
    /// Anything except this server
    AvoidServer(String),
}

impl ServerSelectionMethod {
    fn selected_server_name(&self) -> Option<&str> {
        match self {
            ServerSelectionMethod::PreferredServer(name) => Some(name),
            _ => None,
        }
    }

    fn excluded_server_name(&self) -> Option<&str> {
        match self {
            ServerSelectionMethod::AvoidServer(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ServerSelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSelectionMethod::Automatic => write!(f, "automatic"),
            ServerSelectionMethod::PreferredServer(name) => write!(f, "preferred({})", name),
            ServerSelectionMethod::AvoidServer(name) => write!(f, "avoid({})", name),
        }
    }
}

/// Interface settings that do not come from the server record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDefaults {
    pub listen_port: u16,
    pub dns: Vec<IpAddr>,
}

impl Default for TunnelDefaults {
    fn default() -> Self {
        Self {
            listen_port: 51821,
            dns: vec![IpAddr::V4(Ipv4Addr::new(10, 11, 12, 1))],
        }
    }
}

/// Registration and configuration synthesis
pub struct DeviceManager {
    directory: Arc<dyn DirectoryClient>,
    tokens: TokenStore,
    keys: Arc<KeyStore>,
    cache: Arc<ServerListCache>,
    errors: ErrorEvents,
    defaults: TunnelDefaults,
    lock: Mutex<()>,
}

impl DeviceManager {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        tokens: TokenStore,
        keys: Arc<KeyStore>,
        cache: Arc<ServerListCache>,
        errors: ErrorEvents,
    ) -> Self {
        Self {
            directory,
            tokens,
            keys,
            cache,
            errors,
            defaults: TunnelDefaults::default(),
            lock: Mutex::new(()),
        }
    }

    /// Override listen port / DNS
    pub fn with_defaults(mut self, defaults: TunnelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn server_cache(&self) -> &Arc<ServerListCache> {
        &self.cache
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    /// Register and build a tunnel configuration for the selected server
    pub async fn generate_tunnel_configuration(
        &self,
        selection: &ServerSelectionMethod,
    ) -> Result<(TunnelConfiguration, ServerInfo), VpnError> {
        let _guard = self.lock.lock().await;

        let token = self.fetch_token()?;
        let selected = selection.selected_server_name();
        let excluded = selection.excluded_server_name();
        let mut key_pair = self.keys.current_key_pair()?;

        debug!("Generating tunnel configuration ({})", selection);

        let server = match self.directory.register(&token, key_pair.public_key(), selected).await {
            Ok(servers) => {
                self.cache_servers(&servers);

                match servers.into_iter().find(|server| Some(server.name()) != excluded) {
                    Some(server) => server,
                    None => {
                        self.errors.fire(&VpnError::ServerListInconsistency);
                        self.cached_server(key_pair.public_key(), excluded)?
                    }
                }
            }
            Err(error) => {
                self.handle_client_error(error);
                self.cached_server(key_pair.public_key(), excluded)?
            }
        };

        if let Some(expires_at) = server.expires_at {
            if expires_at < key_pair.expiration() {
                key_pair = self.keys.update_current_key_pair(expires_at)?;
            }
        }

        let configuration = self.tunnel_configuration(&server, &key_pair)?;

        info!(
            "Selected server {} ({}) for {:?}",
            server.name(),
            server.location(),
            key_pair.public_key()
        );
        Ok((configuration, server.server))
    }

    /// Fetch the server list without registering
    ///
    /// On backend failure the cached list is returned instead.
    pub async fn refresh_server_list(&self) -> Result<Arc<Vec<ServerRecord>>, VpnError> {
        let _guard = self.lock.lock().await;

        let token = self.fetch_token()?;

        match self.directory.get_servers(&token).await {
            Ok(servers) => {
                self.cache_servers(&servers);
                Ok(Arc::new(servers))
            }
            Err(error) => {
                self.handle_client_error(error);
                Ok(self.cache.stored_server_list()?)
            }
        }
    }

    /// Exchange an invite code and persist the resulting token
    pub async fn redeem(&self, invite_code: &str) -> Result<(), VpnError> {
        let _guard = self.lock.lock().await;

        let token = self.directory.redeem(invite_code).await.map_err(|error| {
            let error = VpnError::Client(error);
            self.errors.fire(&error);
            error
        })?;

        self.tokens.store_token(&token)?;
        info!("Invite code redeemed");
        Ok(())
    }

    fn fetch_token(&self) -> Result<AuthToken, VpnError> {
        match self.tokens.fetch_token()? {
            Some(token) => Ok(token),
            None => {
                let error = VpnError::NoAuthTokenFound;
                self.errors.fire(&error);
                Err(error)
            }
        }
    }

    fn cache_servers(&self, servers: &[ServerRecord]) {
        if let Err(error) = self.cache.store(servers) {
            self.errors.fire(&VpnError::Store(error));
        }
    }

    fn handle_client_error(&self, error: ClientError) {
        if error == ClientError::InvalidAuthToken {
            warn!("Auth token rejected by the backend, deleting it");
            if let Err(delete_error) = self.tokens.delete_token() {
                self.errors.fire(&delete_error);
            }
        }

        self.errors.fire(&VpnError::Client(error));
    }

    /// First cached server registered with `public_key`, avoiding `excluded`
    /// when any other registered server exists
    fn cached_server(&self, public_key: &PublicKey, excluded: Option<&str>) -> Result<ServerRecord, VpnError> {
        let servers = match self.cache.stored_server_list() {
            Ok(servers) => servers,
            Err(error) => {
                self.errors.fire(&VpnError::Store(error));
                return Err(VpnError::NoServerListFound);
            }
        };

        let mut registered = servers.iter().filter(|server| server.is_registered_with(public_key));
        let preferred = registered.clone().find(|server| Some(server.name()) != excluded);

        match preferred.or_else(|| registered.next()) {
            Some(server) => {
                info!("Falling back to cached server {}", server.name());
                Ok(server.clone())
            }
            None => Err(VpnError::NoServerListFound),
        }
    }

    fn tunnel_configuration(
        &self,
        server: &ServerRecord,
        key_pair: &KeyPair,
    ) -> Result<TunnelConfiguration, VpnError> {
        let allowed_ips = server.allowed_ips.as_ref().ok_or(VpnError::NoServerRegistrationInfo)?;

        let peer_key = PublicKey::from_base64(&server.server.public_key)
            .map_err(|_| VpnError::CouldNotGetPeerPublicKey)?;
        let endpoint = server.endpoint().ok_or(VpnError::CouldNotGetPeerHostName)?;
        let address: IpRange = allowed_ips
            .first()
            .and_then(|range| range.parse().ok())
            .ok_or(VpnError::CouldNotGetInterfaceAddressRange)?;

        let mut peer = PeerConfiguration::new(peer_key);
        peer.endpoint = Some(endpoint);
        peer.allowed_ips = vec![IpRange::any_v4(), IpRange::any_v6()];

        Ok(TunnelConfiguration {
            name: Some(server.name().to_string()),
            interface: InterfaceConfiguration {
                private_key: key_pair.private_key().clone(),
                listen_port: Some(self.defaults.listen_port),
                dns: self.defaults.dns.clone(),
                addresses: vec![address],
            },
            peers: vec![peer],
        })
    }
}
