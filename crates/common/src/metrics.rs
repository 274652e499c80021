//! Transfer metrics for the socket-backed device
//!
//! Counters are updated from the device task and may be read from anywhere
//! (the binary logs a snapshot at shutdown).

use protocol::{KIND_IN, KIND_OUT, KIND_SETUP};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Number of round-trip latency samples kept for min/avg/max
const LATENCY_WINDOW_SIZE: usize = 100;

/// How a forwarded transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Peer replied OK
    Ok,
    /// Peer replied NAK
    Nak,
    /// Peer replied STALL
    Stall,
    /// No reply within the round-trip timeout
    Timeout,
    /// Socket failure or unusable reply
    PeerGone,
    /// Failed before reaching the socket (encode or send failure)
    LocalFailure,
}

/// Rolling latency window (microseconds)
#[derive(Debug)]
struct RollingLatency {
    samples: VecDeque<u64>,
}

impl RollingLatency {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_WINDOW_SIZE),
        }
    }

    fn add_sample(&mut self, latency_us: u64) {
        if self.samples.len() == LATENCY_WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_us);
    }

    fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }
        let sum: u64 = self.samples.iter().sum();
        LatencyStats {
            min_us: self.samples.iter().copied().min().unwrap_or(0),
            max_us: self.samples.iter().copied().max().unwrap_or(0),
            avg_us: sum / self.samples.len() as u64,
            sample_count: self.samples.len(),
        }
    }
}

/// Latency statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    /// Minimum latency in microseconds
    pub min_us: u64,
    /// Maximum latency in microseconds
    pub max_us: u64,
    /// Average latency in microseconds
    pub avg_us: u64,
    /// Number of samples in the window
    pub sample_count: usize,
}

/// Point-in-time copy of [`TransferMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub setups: u64,
    pub ins: u64,
    pub outs: u64,
    /// Zero-length status OUTs completed without a round trip
    pub status_short_circuits: u64,
    /// Transfers refused by the address/state guard
    pub rejected: u64,
    pub ok: u64,
    pub naks: u64,
    pub stalls: u64,
    pub timeouts: u64,
    pub peer_gone: u64,
    pub local_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency: LatencyStats,
}

/// Transfer metrics for a single device
#[derive(Debug)]
pub struct TransferMetrics {
    setups: AtomicU64,
    ins: AtomicU64,
    outs: AtomicU64,
    status_short_circuits: AtomicU64,
    rejected: AtomicU64,
    ok: AtomicU64,
    naks: AtomicU64,
    stalls: AtomicU64,
    timeouts: AtomicU64,
    peer_gone: AtomicU64,
    local_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency: Mutex<RollingLatency>,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMetrics {
    /// Create new transfer metrics
    pub fn new() -> Self {
        Self {
            setups: AtomicU64::new(0),
            ins: AtomicU64::new(0),
            outs: AtomicU64::new(0),
            status_short_circuits: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            ok: AtomicU64::new(0),
            naks: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            peer_gone: AtomicU64::new(0),
            local_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            latency: Mutex::new(RollingLatency::new()),
        }
    }

    /// Record a token about to be forwarded, by wire kind tag
    pub fn record_token(&self, kind: u8) {
        let counter = match kind {
            KIND_SETUP => &self.setups,
            KIND_IN => &self.ins,
            KIND_OUT => &self.outs,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a status-stage OUT resolved locally
    pub fn record_short_circuit(&self) {
        self.status_short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transfer refused before reaching the transport
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a round trip
    ///
    /// `latency` is only sampled when the peer actually replied.
    pub fn record_outcome(
        &self,
        outcome: TransferOutcome,
        bytes_sent: u64,
        bytes_received: u64,
        latency: Duration,
    ) {
        let counter = match outcome {
            TransferOutcome::Ok => &self.ok,
            TransferOutcome::Nak => &self.naks,
            TransferOutcome::Stall => &self.stalls,
            TransferOutcome::Timeout => &self.timeouts,
            TransferOutcome::PeerGone => &self.peer_gone,
            TransferOutcome::LocalFailure => &self.local_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes_received, Ordering::Relaxed);

        if matches!(
            outcome,
            TransferOutcome::Ok | TransferOutcome::Nak | TransferOutcome::Stall
        ) && let Ok(mut window) = self.latency.lock()
        {
            window.add_sample(latency.as_micros() as u64);
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self
            .latency
            .lock()
            .map(|window| window.stats())
            .unwrap_or_default();

        MetricsSnapshot {
            setups: self.setups.load(Ordering::Relaxed),
            ins: self.ins.load(Ordering::Relaxed),
            outs: self.outs.load(Ordering::Relaxed),
            status_short_circuits: self.status_short_circuits.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            naks: self.naks.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            peer_gone: self.peer_gone.load(Ordering::Relaxed),
            local_failures: self.local_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            latency,
        }
    }
}

impl MetricsSnapshot {
    /// Log the snapshot at info level
    pub fn log_summary(&self) {
        info!(
            "Transfers: {} SETUP, {} IN, {} OUT ({} status short-circuits, {} rejected)",
            self.setups, self.ins, self.outs, self.status_short_circuits, self.rejected
        );
        info!(
            "Outcomes: {} ok, {} NAK, {} STALL, {} timeouts, {} peer gone, {} local failures",
            self.ok, self.naks, self.stalls, self.timeouts, self.peer_gone, self.local_failures
        );
        info!(
            "Bytes: {} sent, {} received; latency min {}us avg {}us max {}us over {} samples",
            self.bytes_sent,
            self.bytes_received,
            self.latency.min_us,
            self.latency.avg_us,
            self.latency.max_us,
            self.latency.sample_count
        );
    }
}
