use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::PortError;
use crate::spatial::haversine_km;
use crate::types::DriverId;

use super::{is_better, GeoLocator, NearbyDriver};

#[derive(Debug, Clone, Copy)]
struct Entry {
    lat: f64,
    lon: f64,
    added_at: DateTime<Utc>,
}

/// Brute-force locator: every query scans every indexed position.
///
/// Time complexity: O(n) per query. Good enough for a single city's fleet and
/// the reference behaviour the cell index is compared against.
pub struct ScanLocator {
    positions: RwLock<HashMap<DriverId, Entry>>,
    clock: Arc<dyn Clock>,
}

impl ScanLocator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScanLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScanLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLocator")
            .field("drivers", &self.len())
            .finish()
    }
}

impl GeoLocator for ScanLocator {
    fn nearby(&self, lat: f64, lon: f64, radius_km: f64) -> Result<NearbyDriver, PortError> {
        let positions = self.positions.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(&DriverId, f64)> = None;
        for (id, entry) in positions.iter() {
            let dist = haversine_km(lat, lon, entry.lat, entry.lon);
            if dist <= radius_km && is_better(dist, id, best) {
                best = Some((id, dist));
            }
        }
        best.map(|(id, distance_km)| NearbyDriver {
            driver_id: id.clone(),
            distance_km,
        })
        .ok_or(PortError::NoCandidate)
    }

    fn add(&self, driver: &DriverId, lat: f64, lon: f64) -> Result<(), PortError> {
        let added_at = self.clock.now();
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(driver.clone(), Entry { lat, lon, added_at });
        Ok(())
    }

    fn remove(&self, driver: &DriverId) -> Result<(), PortError> {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(driver);
        Ok(())
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, entry| entry.added_at >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn nearest_within_radius_wins() {
        let locator = ScanLocator::new();
        locator.add(&"far".into(), 40.78, -73.9855).expect("add");
        locator.add(&"near".into(), 40.759, -73.9855).expect("add");

        let hit = locator.nearby(40.758, -73.9855, 3.0).expect("candidate");
        assert_eq!(hit.driver_id, DriverId::new("near"));
        assert!(hit.distance_km < 0.2);
    }

    #[test]
    fn empty_radius_reports_no_candidate() {
        let locator = ScanLocator::new();
        locator.add(&"far".into(), 41.5, -73.9855).expect("add");
        assert_eq!(
            locator.nearby(40.758, -73.9855, 3.0),
            Err(PortError::NoCandidate)
        );
    }

    #[test]
    fn equidistant_drivers_resolve_by_id() {
        let locator = ScanLocator::new();
        locator.add(&"d2".into(), 40.758, -73.9855).expect("add");
        locator.add(&"d1".into(), 40.758, -73.9855).expect("add");
        let hit = locator.nearby(40.758, -73.9855, 3.0).expect("candidate");
        assert_eq!(hit.driver_id, DriverId::new("d1"));
    }

    #[test]
    fn prune_drops_entries_added_before_cutoff() {
        let clock = Arc::new(ManualClock::default());
        let locator = ScanLocator::with_clock(clock.clone());
        locator.add(&"old".into(), 40.758, -73.9855).expect("add");
        clock.advance(Duration::minutes(10));
        locator.add(&"new".into(), 40.758, -73.9855).expect("add");

        locator.prune_older_than(clock.now() - Duration::minutes(5));
        assert_eq!(locator.len(), 1);
        let hit = locator.nearby(40.758, -73.9855, 1.0).expect("candidate");
        assert_eq!(hit.driver_id, DriverId::new("new"));
    }
}
