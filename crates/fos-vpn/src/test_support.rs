//! Shared fixtures and mock collaborators for unit tests.

use crate::adapter::{AdapterError, InterfaceHandle, TunnelAdapter};
use crate::bandwidth::ByteCounters;
use crate::config::TunnelConfiguration;
use crate::connection_tester::{ConnectivityProbe, ProbeOutcome};
use crate::directory::{ClientError, DirectoryClient};
use crate::keys::PublicKey;
use crate::latency::LatencyProbe;
use crate::platform::PlatformHooks;
use crate::secret_store::AuthToken;
use crate::server::{ServerAttributes, ServerInfo, ServerRecord};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

const SERVER_PUBLIC_KEY: &str = "R/BMR6Rr5rzvp7vSIWdAtgAmOLK9m7CqTcDynblM3Us=";

/// Unregistered server record with a valid peer key and one allowed range
pub fn server_record(name: &str) -> ServerRecord {
    let octet = name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b)) % 250 + 1;

    ServerRecord {
        registered_public_keys: Vec::new(),
        allowed_ips: Some(vec!["10.64.0.2/32".to_string()]),
        expires_at: None,
        server: ServerInfo {
            name: name.to_string(),
            attributes: ServerAttributes {
                city: "Lafayette".to_string(),
                country: "us".to_string(),
                state: Some("LA".to_string()),
                timezone_offset: -18000,
            },
            public_key: SERVER_PUBLIC_KEY.to_string(),
            hostnames: vec![format!("{}.vpn.example.net", name)],
            ips: vec![format!("203.0.113.{}", octet)],
            port: 443,
        },
    }
}

pub fn registered_with(mut record: ServerRecord, key: &PublicKey) -> ServerRecord {
    record.registered_public_keys.push(key.to_base64());
    record
}

pub fn interface() -> InterfaceHandle {
    InterfaceHandle {
        name: "wg-test".to_string(),
        address: Some(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))),
    }
}

/// Accept one HTTP/1.1 request, answer with `status` and `body`, and
/// return the raw request text from the join handle.
pub async fn serve_once(status: u16, body: &str) -> (Url, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = body.to_string();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];

        let header_end = loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break raw.len();
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let content_length = String::from_utf8_lossy(&raw[..header_end])
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);

        while raw.len() < header_end + content_length {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }

        let response = format!(
            "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();

        String::from_utf8_lossy(&raw).into_owned()
    });

    (Url::parse(&format!("http://{}/", addr)).unwrap(), handle)
}

#[derive(Default)]
struct DirectoryState {
    register: Option<Result<Vec<ServerRecord>, ClientError>>,
    get_servers: Option<Result<Vec<ServerRecord>, ClientError>>,
    redeem: Option<Result<AuthToken, ClientError>>,
    register_delay: Option<Duration>,
    register_calls: usize,
    last_registered_key: Option<PublicKey>,
    last_preferred_server: Option<String>,
}

/// Scripted backend
#[derive(Default)]
pub struct MockDirectory {
    state: Mutex<DirectoryState>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, result: Result<Vec<ServerRecord>, ClientError>) {
        self.state.lock().unwrap().register = Some(result);
    }

    pub fn set_get_servers(&self, result: Result<Vec<ServerRecord>, ClientError>) {
        self.state.lock().unwrap().get_servers = Some(result);
    }

    pub fn set_redeem(&self, result: Result<AuthToken, ClientError>) {
        self.state.lock().unwrap().redeem = Some(result);
    }

    /// Make every registration take `delay`
    pub fn set_register_delay(&self, delay: Duration) {
        self.state.lock().unwrap().register_delay = Some(delay);
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }

    pub fn last_registered_key(&self) -> Option<PublicKey> {
        self.state.lock().unwrap().last_registered_key.clone()
    }

    pub fn last_preferred_server(&self) -> Option<String> {
        self.state.lock().unwrap().last_preferred_server.clone()
    }
}

#[async_trait]
impl DirectoryClient for MockDirectory {
    async fn get_servers(&self, _token: &AuthToken) -> Result<Vec<ServerRecord>, ClientError> {
        self.state.lock().unwrap().get_servers.clone().unwrap_or(Ok(Vec::new()))
    }

    async fn register(
        &self,
        _token: &AuthToken,
        public_key: &PublicKey,
        preferred_server: Option<&str>,
    ) -> Result<Vec<ServerRecord>, ClientError> {
        let (result, delay) = {
            let mut state = self.state.lock().unwrap();
            state.register_calls += 1;
            state.last_registered_key = Some(public_key.clone());
            state.last_preferred_server = preferred_server.map(str::to_string);
            (state.register.clone().unwrap_or(Ok(Vec::new())), state.register_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn redeem(&self, _invite_code: &str) -> Result<AuthToken, ClientError> {
        self.state
            .lock()
            .unwrap()
            .redeem
            .clone()
            .unwrap_or(Err(ClientError::InvalidInviteCode))
    }
}

#[derive(Default)]
struct AdapterState {
    running: bool,
    starts: Vec<TunnelConfiguration>,
    updates: Vec<(TunnelConfiguration, bool)>,
    stops: usize,
    start_error: Option<AdapterError>,
    update_error: Option<AdapterError>,
    counters: Option<ByteCounters>,
}

/// In-memory tunnel adapter that records what it was asked to do
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<AdapterState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, error: AdapterError) {
        self.state.lock().unwrap().start_error = Some(error);
    }

    pub fn fail_updates(&self, error: Option<AdapterError>) {
        self.state.lock().unwrap().update_error = error;
    }

    pub fn set_counters(&self, counters: Option<ByteCounters>) {
        self.state.lock().unwrap().counters = counters;
    }

    pub fn starts(&self) -> Vec<TunnelConfiguration> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn updates(&self) -> Vec<(TunnelConfiguration, bool)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

#[async_trait]
impl TunnelAdapter for MockAdapter {
    async fn start(&self, config: &TunnelConfiguration) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.starts.push(config.clone());
        if let Some(ref error) = state.start_error {
            return Err(error.clone());
        }
        state.running = true;
        Ok(())
    }

    async fn update(&self, config: &TunnelConfiguration, reassert: bool) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.updates.push((config.clone(), reassert));
        match state.update_error {
            Some(ref error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.running = false;
        Ok(())
    }

    async fn byte_counters(&self) -> Option<ByteCounters> {
        self.state.lock().unwrap().counters
    }

    fn interface(&self) -> Option<InterfaceHandle> {
        self.state.lock().unwrap().running.then(interface)
    }

    async fn runtime_configuration(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if !state.running {
            return None;
        }

        state
            .updates
            .last()
            .map(|(config, _)| config)
            .or(state.starts.last())
            .map(TunnelConfiguration::to_wg_config)
    }
}

/// Returns the scripted outcomes in order, then repeats the last one
pub struct ScriptedProbe {
    outcomes: Vec<ProbeOutcome>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(outcomes: Vec<ProbeOutcome>) -> Self {
        Self {
            outcomes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn check(&self, _interface: &InterfaceHandle) -> ProbeOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        match self.outcomes.get(call).or(self.outcomes.last()) {
            Some(outcome) => *outcome,
            None => ProbeOutcome {
                through_tunnel: true,
                outside_tunnel: true,
            },
        }
    }
}

pub struct FixedLatencyProbe;

#[async_trait]
impl LatencyProbe for FixedLatencyProbe {
    async fn measure(&self, _ip: Ipv4Addr) -> Result<Duration, String> {
        Ok(Duration::from_millis(20))
    }
}

/// Counts on-demand requests
#[derive(Default)]
pub struct RecordingPlatform {
    enabled: AtomicUsize,
    disabled: AtomicUsize,
}

impl RecordingPlatform {
    pub fn enabled(&self) -> usize {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disabled(&self) -> usize {
        self.disabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformHooks for RecordingPlatform {
    async fn enable_on_demand(&self) {
        self.enabled.fetch_add(1, Ordering::SeqCst);
    }

    async fn disable_on_demand(&self) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
    }
}
