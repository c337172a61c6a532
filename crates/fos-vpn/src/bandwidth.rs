//! Bandwidth Analyzer
//!
//! Decides whether the tunnel is idle from the last two byte-counter
//! snapshots. Idle connections are safe to rekey.

use tokio::time::Instant;
use tracing::debug;

/// Below this rate (in both directions) the connection counts as idle
pub const IDLE_THRESHOLD_BYTES_PER_SECOND: f64 = 1024.0;

/// Cumulative byte counters reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl ByteCounters {
    pub fn new(rx_bytes: u64, tx_bytes: u64) -> Self {
        Self { rx_bytes, tx_bytes }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    counters: ByteCounters,
    at: Instant,
}

/// Idle detection over two consecutive samples
#[derive(Debug, Default)]
pub struct BandwidthAnalyzer {
    previous: Option<Snapshot>,
    current: Option<Snapshot>,
    idle_prevented: bool,
}

impl BandwidthAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample taken now
    pub fn record(&mut self, counters: ByteCounters) {
        self.record_at(counters, Instant::now());
    }

    pub(crate) fn record_at(&mut self, counters: ByteCounters, at: Instant) {
        self.previous = self.current.take();
        self.current = Some(Snapshot { counters, at });
        self.idle_prevented = false;
    }

    /// Treat the connection as busy until the next sample
    pub fn prevent_idle(&mut self) {
        self.idle_prevented = true;
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.previous = None;
        self.current = None;
        self.idle_prevented = false;
    }

    /// Both directions below the idle threshold over the last window
    pub fn is_connection_idle(&self) -> bool {
        if self.idle_prevented {
            return false;
        }

        let (Some(previous), Some(current)) = (self.previous, self.current) else {
            return false;
        };

        let seconds = current.at.saturating_duration_since(previous.at).as_secs_f64();
        if seconds <= 0.0 {
            return false;
        }

        let rx_rate = current.counters.rx_bytes.saturating_sub(previous.counters.rx_bytes) as f64 / seconds;
        let tx_rate = current.counters.tx_bytes.saturating_sub(previous.counters.tx_bytes) as f64 / seconds;

        debug!("Bandwidth rx {:.0} B/s, tx {:.0} B/s", rx_rate, tx_rate);
        rx_rate < IDLE_THRESHOLD_BYTES_PER_SECOND && tx_rate < IDLE_THRESHOLD_BYTES_PER_SECOND
    }
}
