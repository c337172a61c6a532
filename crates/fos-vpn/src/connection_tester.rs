//! Connection Tester
//!
//! Periodically checks whether traffic still flows through the tunnel.
//! Each probe has two legs: one bound to the tunnel interface and one over
//! the regular network. The tunnel is only considered down when the tunnel
//! leg fails while the outside leg succeeds; if both fail the device is
//! simply offline and the probe result is ignored.
//!
//! A single task runs the probe loop, so only one probe is ever in flight.
//! Reports carry the run number they were produced in; a run ends with
//! `stop()`, and anything it produced afterwards is stale.

use crate::adapter::InterfaceHandle;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default time between probes
pub const DEFAULT_TEST_INTERVAL: Duration = Duration::from_secs(15);

/// Default timeout of each probe leg
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub through_tunnel: bool,
    pub outside_tunnel: bool,
}

impl ProbeOutcome {
    /// Only the VPN is down
    pub fn is_tunnel_down(&self) -> bool {
        !self.through_tunnel && self.outside_tunnel
    }

    /// Neither leg worked: the device is offline
    pub fn is_offline(&self) -> bool {
        !self.through_tunnel && !self.outside_tunnel
    }
}

/// Liveness probe
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self, interface: &InterfaceHandle) -> ProbeOutcome;
}

/// TCP connect probe against a well-known endpoint
#[derive(Debug, Clone)]
pub struct TcpConnectivityProbe {
    target: SocketAddr,
    timeout: Duration,
}

impl TcpConnectivityProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self, bind: Option<IpAddr>) -> Result<(), String> {
        let socket = if self.target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| e.to_string())?;

        if let Some(address) = bind {
            socket.bind(SocketAddr::new(address, 0)).map_err(|e| e.to_string())?;
        }

        match timeout(self.timeout, socket.connect(self.target)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(format!("Connection failed: {}", e)),
            Err(_) => Err("Connection timeout".to_string()),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpConnectivityProbe {
    async fn check(&self, interface: &InterfaceHandle) -> ProbeOutcome {
        // The tunnel leg is bound to the tunnel address when it matches the
        // target's family; otherwise it relies on the tunnel's default route
        let bind = interface
            .address
            .filter(|address| address.is_ipv4() == self.target.is_ipv4());

        let (tunnel, outside) = tokio::join!(self.connect(bind), self.connect(None));

        if let Err(ref e) = tunnel {
            debug!("Tunnel probe via {} failed: {}", interface.name, e);
        }
        if let Err(ref e) = outside {
            debug!("Outside probe failed: {}", e);
        }

        ProbeOutcome {
            through_tunnel: tunnel.is_ok(),
            outside_tunnel: outside.is_ok(),
        }
    }
}

/// Tester verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterEvent {
    /// Healthy, and no failure since the last healthy probe
    Connected,
    /// First healthy probe after one or more failures
    Reconnected,
    /// Consecutive failure number `failure_count`
    Disconnected { failure_count: u32 },
}

/// A verdict tagged with the run that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TesterReport {
    pub run: u64,
    pub event: TesterEvent,
}

/// Consecutive failure bookkeeping
#[derive(Debug, Default)]
struct FailureTracker {
    failure_count: u32,
}

impl FailureTracker {
    fn record(&mut self, outcome: ProbeOutcome) -> Option<TesterEvent> {
        if outcome.through_tunnel {
            if self.failure_count == 0 {
                return Some(TesterEvent::Connected);
            }
            self.failure_count = 0;
            return Some(TesterEvent::Reconnected);
        }

        if outcome.is_offline() {
            return None;
        }

        self.failure_count += 1;
        Some(TesterEvent::Disconnected {
            failure_count: self.failure_count,
        })
    }
}

struct ActiveRun {
    run: u64,
    task: JoinHandle<()>,
}

/// Periodic tunnel liveness tester
pub struct ConnectionTester {
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    reports: mpsc::UnboundedSender<TesterReport>,
    current_run: Arc<AtomicU64>,
    test_now: Arc<Notify>,
    active: Mutex<Option<ActiveRun>>,
}

impl ConnectionTester {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, reports: mpsc::UnboundedSender<TesterReport>) -> Self {
        Self {
            probe,
            interval: DEFAULT_TEST_INTERVAL,
            reports,
            current_run: Arc::new(AtomicU64::new(0)),
            test_now: Arc::new(Notify::new()),
            active: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start probing `interface`; no-op when already running
    pub fn start(&self, interface: InterfaceHandle) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            debug!("Connection tester already running");
            return;
        }

        let run = self.current_run.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting connection tester on {} (run {})", interface.name, run);

        let task = tokio::spawn(probe_loop(
            self.probe.clone(),
            interface,
            self.interval,
            run,
            self.current_run.clone(),
            self.test_now.clone(),
            self.reports.clone(),
        ));

        *active = Some(ActiveRun { run, task });
    }

    /// Stop probing; no-op when not running
    pub fn stop(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(run) = active.take() else {
            return;
        };

        // Invalidate before aborting so an in-flight result is dropped
        self.current_run.fetch_add(1, Ordering::SeqCst);
        run.task.abort();
        info!("Stopped connection tester (run {})", run.run);
    }

    /// Run one probe out of schedule
    pub fn test_immediately(&self) {
        if self.is_running() {
            self.test_now.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Run whose reports are current, if any
    pub fn current_run(&self) -> Option<u64> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.run)
    }
}

impl Drop for ConnectionTester {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_loop(
    probe: Arc<dyn ConnectivityProbe>,
    interface: InterfaceHandle,
    period: Duration,
    run: u64,
    current_run: Arc<AtomicU64>,
    test_now: Arc<Notify>,
    reports: mpsc::UnboundedSender<TesterReport>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker = FailureTracker::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = test_now.notified() => {}
        }

        let outcome = probe.check(&interface).await;

        if current_run.load(Ordering::SeqCst) != run {
            debug!("Discarding probe result from stopped run {}", run);
            return;
        }

        let Some(event) = tracker.record(outcome) else {
            debug!("Both probe legs failed, device looks offline");
            continue;
        };

        if let TesterEvent::Disconnected { failure_count } = event {
            warn!("Tunnel probe failed ({} consecutive)", failure_count);
        }

        if reports.send(TesterReport { run, event }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{interface, ScriptedProbe};
    use tokio::net::TcpListener;

    const UP: ProbeOutcome = ProbeOutcome { through_tunnel: true, outside_tunnel: true };
    const VPN_DOWN: ProbeOutcome = ProbeOutcome { through_tunnel: false, outside_tunnel: true };
    const OFFLINE: ProbeOutcome = ProbeOutcome { through_tunnel: false, outside_tunnel: false };

    #[test]
    fn test_failure_tracking() {
        let mut tracker = FailureTracker::default();

        assert_eq!(tracker.record(UP), Some(TesterEvent::Connected));
        assert_eq!(tracker.record(UP), Some(TesterEvent::Connected));
        assert_eq!(tracker.record(VPN_DOWN), Some(TesterEvent::Disconnected { failure_count: 1 }));
        assert_eq!(tracker.record(OFFLINE), None);
        assert_eq!(tracker.record(VPN_DOWN), Some(TesterEvent::Disconnected { failure_count: 2 }));
        assert_eq!(tracker.record(UP), Some(TesterEvent::Reconnected));
        assert_eq!(tracker.record(UP), Some(TesterEvent::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_probe_after_one_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = Arc::new(ScriptedProbe::new(vec![UP, VPN_DOWN]));
        let tester = ConnectionTester::new(probe.clone(), tx).with_interval(Duration::from_secs(15));

        tester.start(interface());
        tester.start(interface());
        let run = tester.current_run().unwrap();

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(probe.calls(), 0);

        let report = rx.recv().await.unwrap();
        assert_eq!(report, TesterReport { run, event: TesterEvent::Connected });

        let report = rx.recv().await.unwrap();
        assert_eq!(report.event, TesterEvent::Disconnected { failure_count: 1 });

        tester.stop();
        tester.stop();
        assert!(!tester.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = Arc::new(ScriptedProbe::new(vec![VPN_DOWN]));
        let tester = ConnectionTester::new(probe.clone(), tx).with_interval(Duration::from_secs(3600));

        tester.start(interface());
        tester.test_immediately();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.event, TesterEvent::Disconnected { failure_count: 1 });
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_uses_new_run() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tester = ConnectionTester::new(Arc::new(ScriptedProbe::new(vec![UP])), tx);

        tester.start(interface());
        let first = tester.current_run().unwrap();
        tester.stop();
        assert_eq!(tester.current_run(), None);

        tester.start(interface());
        assert!(tester.current_run().unwrap() > first);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let probe = TcpConnectivityProbe::new(target).with_timeout(Duration::from_secs(2));
        let handle = InterfaceHandle {
            name: "lo".to_string(),
            address: Some("127.0.0.1".parse().unwrap()),
        };

        assert_eq!(probe.check(&handle).await, UP);
    }
}
