//! Heartbeat staleness: pruning, freshness gate and population snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::telemetry::DriverCounts;
use crate::types::DriverId;

use super::DispatchStore;

impl DispatchStore {
    fn cutoff(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Evict drivers whose last heartbeat is older than `now - ttl` and who
    /// are not attached to a ride. Returns how many were removed.
    pub fn prune_stale_drivers(&self, ttl: Duration) -> u64 {
        let cutoff = self.cutoff(ttl);
        let mut state = self.write();

        let mut stale = 0u64;
        let mut evicted: Vec<DriverId> = Vec::new();
        for (id, driver) in &state.drivers {
            if driver.updated_at >= cutoff {
                continue;
            }
            stale += 1;
            if driver.ride_id.is_none() {
                evicted.push(id.clone());
            }
        }
        for id in &evicted {
            state.drivers.remove(id);
            if let Some(geo) = &self.geo {
                if let Err(error) = geo.remove(id) {
                    debug!(driver = %id, %error, "geo remove failed");
                }
            }
        }
        if let Some(geo) = &self.geo {
            geo.prune_older_than(cutoff);
        }

        let removed = evicted.len() as u64;
        self.telemetry.record_prune(removed, stale);
        if removed > 0 {
            debug!(removed, stale, "pruned stale drivers");
        }
        removed
    }

    /// True when the driver is known and heartbeated within `ttl`.
    pub fn driver_is_fresh(&self, driver_id: &DriverId, ttl: Duration) -> bool {
        let cutoff = self.cutoff(ttl);
        self.read()
            .drivers
            .get(driver_id)
            .is_some_and(|driver| driver.updated_at >= cutoff)
    }

    /// Total, available and stale driver counts. A zero `ttl` counts nobody as stale.
    pub fn snapshot_drivers(&self, ttl: Duration) -> DriverCounts {
        let cutoff = self.cutoff(ttl);
        let state = self.read();
        let mut counts = DriverCounts::default();
        for driver in state.drivers.values() {
            counts.total += 1;
            if driver.available {
                counts.available += 1;
            }
            if !ttl.is_zero() && driver.updated_at < cutoff {
                counts.stale += 1;
            }
        }
        counts
    }

    /// Drivers pruned since start.
    pub fn prune_count(&self) -> u64 {
        self.telemetry.pruned_total()
    }

    /// Drivers removed by the most recent prune.
    pub fn last_pruned(&self) -> u64 {
        self.telemetry.last_pruned()
    }

    /// Drivers found stale by the most recent prune, attached or not.
    pub fn stale_count(&self) -> u64 {
        self.telemetry.stale_drivers()
    }
}
