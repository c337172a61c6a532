//! Latency Reporter
//!
//! Measures round-trip time to the connected server on its own schedule and
//! broadcasts each measurement as [`SessionEvent::LatencyReported`].

use crate::status::SessionEvent;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

/// Default time between measurements
pub const DEFAULT_LATENCY_INTERVAL: Duration = Duration::from_secs(60);

/// RTT measurement
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn measure(&self, ip: Ipv4Addr) -> Result<Duration, String>;
}

/// TCP connect time as a latency estimate
#[derive(Debug, Clone)]
pub struct TcpLatencyProbe {
    port: u16,
    timeout: Duration,
}

impl TcpLatencyProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl LatencyProbe for TcpLatencyProbe {
    async fn measure(&self, ip: Ipv4Addr) -> Result<Duration, String> {
        let start = Instant::now();

        match timeout(self.timeout, TcpStream::connect(SocketAddr::from((ip, self.port)))).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(format!("Connection failed: {}", e)),
            Err(_) => Err("Connection timeout".to_string()),
        }
    }
}

struct Running {
    ip: Ipv4Addr,
    task: JoinHandle<()>,
}

/// Periodic latency measurement for the current server
pub struct LatencyReporter {
    probe: Arc<dyn LatencyProbe>,
    interval: Duration,
    events: broadcast::Sender<SessionEvent>,
    running: Option<Running>,
}

impl LatencyReporter {
    pub fn new(probe: Arc<dyn LatencyProbe>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            probe,
            interval: DEFAULT_LATENCY_INTERVAL,
            events,
            running: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start measuring `ip`; restarts if a different IP was being measured
    pub fn start(&mut self, ip: Ipv4Addr, server: String) {
        if self.current_ip() == Some(ip) {
            return;
        }
        self.stop();

        info!("Starting latency reporter for {} ({})", server, ip);

        let probe = self.probe.clone();
        let events = self.events.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match probe.measure(ip).await {
                    Ok(latency) => {
                        debug!("Latency to {}: {:?}", server, latency);
                        let _ = events.send(SessionEvent::LatencyReported {
                            server: server.clone(),
                            latency,
                        });
                    }
                    Err(e) => debug!("Latency measurement to {} failed: {}", server, e),
                }
            }
        });

        self.running = Some(Running { ip, task });
    }

    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            debug!("Stopped latency reporter for {}", running.ip);
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    pub fn current_ip(&self) -> Option<Ipv4Addr> {
        self.running.as_ref().map(|running| running.ip)
    }
}

impl Drop for LatencyReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
