//! Telemetry / KPIs: dispatch counters shared across the store, watchdog and service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters plus the gauges refreshed by each prune cycle.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    pruned_total: AtomicU64,
    last_pruned: AtomicU64,
    stale_drivers: AtomicU64,
    rides_requested: AtomicU64,
    rides_accepted: AtomicU64,
    rides_cancelled: AtomicU64,
    rides_completed: AtomicU64,
    accept_timeouts: AtomicU64,
    reassignments: AtomicU64,
    events_logged: AtomicU64,
    match_count: AtomicU64,
    match_latency_ns: AtomicU64,
}

impl DispatchTelemetry {
    pub fn record_prune(&self, removed: u64, stale: u64) {
        if removed > 0 {
            self.pruned_total.fetch_add(removed, Ordering::Relaxed);
        }
        self.last_pruned.store(removed, Ordering::Relaxed);
        self.stale_drivers.store(stale, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.rides_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept(&self) {
        self.rides_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.rides_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.rides_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Watchdog fired and found the ride already out of `assigned`.
    pub fn record_accept_timeout(&self) {
        self.accept_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reassignment(&self) {
        self.reassignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.match_count.fetch_add(1, Ordering::Relaxed);
        self.match_latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn pruned_total(&self) -> u64 {
        self.pruned_total.load(Ordering::Relaxed)
    }

    pub fn last_pruned(&self) -> u64 {
        self.last_pruned.load(Ordering::Relaxed)
    }

    pub fn stale_drivers(&self) -> u64 {
        self.stale_drivers.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let match_count = self.match_count.load(Ordering::Relaxed);
        let latency_ns = self.match_latency_ns.load(Ordering::Relaxed);
        TelemetrySnapshot {
            pruned_total: self.pruned_total(),
            last_pruned: self.last_pruned(),
            stale_drivers: self.stale_drivers(),
            rides_requested: self.rides_requested.load(Ordering::Relaxed),
            rides_accepted: self.rides_accepted.load(Ordering::Relaxed),
            rides_cancelled: self.rides_cancelled.load(Ordering::Relaxed),
            rides_completed: self.rides_completed.load(Ordering::Relaxed),
            accept_timeouts: self.accept_timeouts.load(Ordering::Relaxed),
            reassignments: self.reassignments.load(Ordering::Relaxed),
            events_logged: self.events_logged.load(Ordering::Relaxed),
            match_count,
            mean_match_latency_us: if match_count == 0 {
                0.0
            } else {
                latency_ns as f64 / match_count as f64 / 1_000.0
            },
        }
    }
}

/// Point-in-time copy of [`DispatchTelemetry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub pruned_total: u64,
    pub last_pruned: u64,
    pub stale_drivers: u64,
    pub rides_requested: u64,
    pub rides_accepted: u64,
    pub rides_cancelled: u64,
    pub rides_completed: u64,
    pub accept_timeouts: u64,
    pub reassignments: u64,
    pub events_logged: u64,
    pub match_count: u64,
    pub mean_match_latency_us: f64,
}

/// Driver population at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverCounts {
    pub total: usize,
    pub available: usize,
    pub stale: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_gauges_replace_and_total_accumulates() {
        let telemetry = DispatchTelemetry::default();
        telemetry.record_prune(3, 5);
        telemetry.record_prune(0, 2);
        assert_eq!(telemetry.pruned_total(), 3);
        assert_eq!(telemetry.last_pruned(), 0);
        assert_eq!(telemetry.stale_drivers(), 2);
    }

    #[test]
    fn mean_latency_is_zero_without_matches() {
        let telemetry = DispatchTelemetry::default();
        assert_eq!(telemetry.snapshot().mean_match_latency_us, 0.0);
        telemetry.record_match_latency(Duration::from_micros(10));
        telemetry.record_match_latency(Duration::from_micros(30));
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.match_count, 2);
        assert!((snapshot.mean_match_latency_us - 20.0).abs() < 1e-9);
    }
}
