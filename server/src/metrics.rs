//! Relay traffic counters.
//!
//! One [`RelayStats`] instance is shared by every worker's logic and read
//! by the statistics timer on the engine thread. Counters are taken and
//! reset on each tick, so the report shows per-interval traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared traffic counters, reset on every statistics tick.
#[derive(Debug, Default)]
pub struct RelayStats {
    client_datagrams: AtomicU64,
    client_bytes: AtomicU64,
    peer_datagrams: AtomicU64,
    peer_bytes: AtomicU64,
    sent_datagrams: AtomicU64,
    sent_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub client_datagrams: u64,
    pub client_bytes: u64,
    pub peer_datagrams: u64,
    pub peer_bytes: u64,
    pub sent_datagrams: u64,
    pub sent_bytes: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_client(&self, bytes: usize) {
        self.client_datagrams.fetch_add(1, Ordering::Relaxed);
        self.client_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_peer(&self, bytes: usize) {
        self.peer_datagrams.fetch_add(1, Ordering::Relaxed);
        self.peer_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sent(&self, bytes: usize) {
        self.sent_datagrams.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Take the current counters, resetting them to zero.
    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            client_datagrams: self.client_datagrams.swap(0, Ordering::Relaxed),
            client_bytes: self.client_bytes.swap(0, Ordering::Relaxed),
            peer_datagrams: self.peer_datagrams.swap(0, Ordering::Relaxed),
            peer_bytes: self.peer_bytes.swap(0, Ordering::Relaxed),
            sent_datagrams: self.sent_datagrams.swap(0, Ordering::Relaxed),
            sent_bytes: self.sent_bytes.swap(0, Ordering::Relaxed),
        }
    }

    /// Log one interval's traffic.
    pub fn report(&self, interval: Duration) {
        let snapshot = self.take();
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        tracing::info!(
            client_pps = (snapshot.client_datagrams as f64 / secs) as u64,
            peer_pps = (snapshot.peer_datagrams as f64 / secs) as u64,
            sent_pps = (snapshot.sent_datagrams as f64 / secs) as u64,
            client_bytes = snapshot.client_bytes,
            peer_bytes = snapshot.peer_bytes,
            sent_bytes = snapshot.sent_bytes,
            "statistics"
        );
    }
}
