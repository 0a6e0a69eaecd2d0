//! Link statistics
//!
//! Byte throughput plus protocol health counters. Every counter is a relaxed
//! atomic so the decode path can bump them without locking.

use crate::constants::RATE_UPDATE_MIN_INTERVAL_SECS;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Traffic and error counters with rate calculation (fully lock-free)
pub struct Stats {
    /// Total bytes written to the transport
    tx_total: AtomicU64,
    /// Total bytes read from the transport
    rx_total: AtomicU64,
    /// Snapshot of tx_total at last rate calculation
    tx_snapshot: AtomicU64,
    /// Snapshot of rx_total at last rate calculation
    rx_snapshot: AtomicU64,
    start_time: Instant,
    /// Nanoseconds since start_time at last rate calculation
    last_calc_nanos: AtomicU64,
    /// Cached rates in KB/s (f64 bits)
    tx_rate: AtomicU64,
    rx_rate: AtomicU64,

    frames: AtomicU64,
    framing_errors: AtomicU64,
    dispatch_errors: AtomicU64,
    retries: AtomicU64,
    request_failures: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub frames: u64,
    pub framing_errors: u64,
    pub dispatch_errors: u64,
    pub retries: u64,
    pub request_failures: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            tx_total: AtomicU64::new(0),
            rx_total: AtomicU64::new(0),
            tx_snapshot: AtomicU64::new(0),
            rx_snapshot: AtomicU64::new(0),
            start_time: Instant::now(),
            last_calc_nanos: AtomicU64::new(0),
            tx_rate: AtomicU64::new(0),
            rx_rate: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_tx(&self, bytes: usize) {
        self.tx_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_rx(&self, bytes: usize) {
        self.rx_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Frame decoded and dispatched successfully
    #[inline]
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_request_failure(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.tx_total.load(Ordering::Relaxed),
            rx_bytes: self.rx_total.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
        }
    }

    /// Update rate calculations and return (tx_kb_s, rx_kb_s)
    /// Call this periodically; calls closer than the minimum interval return
    /// the cached values
    pub fn update_rates(&self) -> (f64, f64) {
        let now_nanos = self.start_time.elapsed().as_nanos() as u64;
        let last_nanos = self.last_calc_nanos.load(Ordering::Relaxed);
        let elapsed = now_nanos.saturating_sub(last_nanos) as f64 / 1_000_000_000.0;

        if elapsed < RATE_UPDATE_MIN_INTERVAL_SECS {
            return self.cached_rates();
        }

        // Try to claim the update (avoid duplicate calculations)
        if self
            .last_calc_nanos
            .compare_exchange(last_nanos, now_nanos, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return self.cached_rates();
        }

        let tx_now = self.tx_total.load(Ordering::Relaxed);
        let rx_now = self.rx_total.load(Ordering::Relaxed);
        let tx_prev = self.tx_snapshot.swap(tx_now, Ordering::Relaxed);
        let rx_prev = self.rx_snapshot.swap(rx_now, Ordering::Relaxed);

        let tx_rate = tx_now.saturating_sub(tx_prev) as f64 / elapsed / 1024.0;
        let rx_rate = rx_now.saturating_sub(rx_prev) as f64 / elapsed / 1024.0;

        self.tx_rate.store(tx_rate.to_bits(), Ordering::Relaxed);
        self.rx_rate.store(rx_rate.to_bits(), Ordering::Relaxed);

        (tx_rate, rx_rate)
    }

    fn cached_rates(&self) -> (f64, f64) {
        let tx = f64::from_bits(self.tx_rate.load(Ordering::Relaxed));
        let rx = f64::from_bits(self.rx_rate.load(Ordering::Relaxed));
        (tx, rx)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.add_rx(100);
        stats.add_rx(28);
        stats.add_tx(6);
        stats.record_frame();
        stats.record_framing_error();
        stats.record_retry();
        stats.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.rx_bytes, 128);
        assert_eq!(snap.tx_bytes, 6);
        assert_eq!(snap.frames, 1);
        assert_eq!(snap.framing_errors, 1);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.request_failures, 0);
    }

    #[test]
    fn test_rates_are_cached_between_updates() {
        let stats = Stats::new();
        std::thread::sleep(Duration::from_millis(120));
        stats.add_rx(2048);
        let (_, rx) = stats.update_rates();
        assert!(rx > 0.0);

        // Too soon for a new sample: same value back
        stats.add_rx(1_000_000);
        let (_, again) = stats.update_rates();
        assert_eq!(again, rx);
    }
}
