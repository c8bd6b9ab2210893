//! Nearest-driver matching with an index fast path and a scan fallback.
//!
//! # Algorithm
//!
//! 1. Ask the [`GeoLocator`] (if one is wired in) for the single nearest
//!    driver inside the radius.
//! 2. Accept that answer only when the candidate is not excluded, is
//!    available in the store's own driver map, and its last heartbeat in that
//!    map lies inside the radius.
//! 3. Otherwise (rejected candidate, locator error, no locator) scan every
//!    driver: drop excluded and unavailable ones, compute haversine distance
//!    to their last position and keep the strictly smallest distance within
//!    the radius. Equal distances resolve to the smaller driver id.
//!
//! The index may be stale, partitioned or down; the scan is what guarantees
//! the radius and exclusion constraints.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::geo::{is_better, GeoLocator};
use crate::spatial::distance_km;
use crate::types::{Coordinate, DriverId, DriverState};

/// Where a match came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    Index,
    Scan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub driver_id: DriverId,
    pub pickup_distance_km: f64,
    pub path: MatchPath,
}

#[derive(Debug, Clone)]
pub struct MatchQuery<'a> {
    pub pickup: &'a Coordinate,
    pub radius_km: f64,
    pub exclude: &'a HashSet<DriverId>,
}

impl<'a> MatchQuery<'a> {
    pub fn new(pickup: &'a Coordinate, radius_km: f64, exclude: &'a HashSet<DriverId>) -> Self {
        Self {
            pickup,
            radius_km,
            exclude,
        }
    }
}

/// Pick the nearest eligible driver for `query`, or `None` if nobody qualifies.
pub fn find_nearest_driver(
    drivers: &HashMap<DriverId, DriverState>,
    locator: Option<&dyn GeoLocator>,
    query: &MatchQuery<'_>,
) -> Option<MatchCandidate> {
    if let Some(locator) = locator {
        match locator.nearby(
            query.pickup.latitude,
            query.pickup.longitude,
            query.radius_km,
        ) {
            Ok(hit) => {
                if let Some(candidate) = verify_index_hit(drivers, query, hit.driver_id.clone()) {
                    return Some(candidate);
                }
                debug!(
                    driver = %hit.driver_id,
                    index_km = hit.distance_km,
                    "index candidate ineligible, scanning"
                );
            }
            Err(error) => debug!(%error, "geo index miss, scanning"),
        }
    }
    scan_nearest(drivers, query)
}

/// Re-check an index answer against the store's own map. The distance is
/// recomputed from the driver's last heartbeat; the locator's figure is
/// never trusted.
fn verify_index_hit(
    drivers: &HashMap<DriverId, DriverState>,
    query: &MatchQuery<'_>,
    driver_id: DriverId,
) -> Option<MatchCandidate> {
    if query.exclude.contains(&driver_id) {
        return None;
    }
    let driver = drivers.get(&driver_id).filter(|d| d.available)?;
    let dist = distance_km(query.pickup, &driver.location);
    (dist <= query.radius_km).then_some(MatchCandidate {
        driver_id,
        pickup_distance_km: dist,
        path: MatchPath::Index,
    })
}

/// Linear fallback over the store's own driver map.
pub fn scan_nearest(
    drivers: &HashMap<DriverId, DriverState>,
    query: &MatchQuery<'_>,
) -> Option<MatchCandidate> {
    let mut best: Option<(&DriverId, f64)> = None;
    for (id, driver) in drivers {
        if !driver.available || query.exclude.contains(id) {
            continue;
        }
        let dist = distance_km(query.pickup, &driver.location);
        if dist <= query.radius_km && is_better(dist, id, best) {
            best = Some((id, dist));
        }
    }
    best.map(|(id, dist)| MatchCandidate {
        driver_id: id.clone(),
        pickup_distance_km: dist,
        path: MatchPath::Scan,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::geo::ScanLocator;
    use crate::test_helpers::{FailingLocator, FixedLocator};
    use crate::types::{DriverStatus, RideId, DRIVER_RADIUS_KM};

    fn driver(id: &str, lat: f64, lon: f64, available: bool) -> (DriverId, DriverState) {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        let mut state = DriverState {
            id: DriverId::new(id),
            available: true,
            location: Coordinate::new(lat, lon, at),
            updated_at: at,
            ride_id: None,
            status: DriverStatus::Idle,
            radius_km: DRIVER_RADIUS_KM,
        };
        if !available {
            state.attach(&RideId::new("ride_busy"), DriverStatus::Assigned);
        }
        (state.id.clone(), state)
    }

    fn pickup() -> Coordinate {
        Coordinate::new(40.758, -73.9855, DateTime::<Utc>::UNIX_EPOCH)
    }

    #[test]
    fn scan_picks_closest_available_driver() {
        let drivers: HashMap<_, _> = [
            driver("busy", 40.758, -73.9855, false),
            driver("near", 40.760, -73.9855, true),
            driver("far", 40.770, -73.9855, true),
        ]
        .into_iter()
        .collect();
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, None, &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.driver_id, DriverId::new("near"));
        assert_eq!(hit.path, MatchPath::Scan);
    }

    #[test]
    fn scan_honours_radius_and_exclusions() {
        let drivers: HashMap<_, _> = [
            driver("excluded", 40.758, -73.9855, true),
            driver("outside", 40.80, -73.9855, true),
        ]
        .into_iter()
        .collect();
        let exclude: HashSet<_> = [DriverId::new("excluded")].into_iter().collect();
        let p = pickup();
        assert!(find_nearest_driver(&drivers, None, &MatchQuery::new(&p, 3.0, &exclude)).is_none());
    }

    #[test]
    fn index_answer_used_when_eligible() {
        let drivers: HashMap<_, _> = [driver("d1", 40.759, -73.9855, true)].into_iter().collect();
        let locator = ScanLocator::new();
        locator.add(&"d1".into(), 40.759, -73.9855).expect("add");
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.path, MatchPath::Index);
        assert_eq!(hit.driver_id, DriverId::new("d1"));
    }

    #[test]
    fn excluded_index_answer_falls_back_to_scan() {
        let drivers: HashMap<_, _> = [
            driver("d1", 40.758, -73.9855, true),
            driver("d2", 40.765, -73.9855, true),
        ]
        .into_iter()
        .collect();
        let locator = FixedLocator::new("d1", 0.0);
        let exclude: HashSet<_> = [DriverId::new("d1")].into_iter().collect();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.driver_id, DriverId::new("d2"));
        assert_eq!(hit.path, MatchPath::Scan);
    }

    #[test]
    fn stale_index_answer_for_unknown_driver_falls_back() {
        let drivers: HashMap<_, _> = [driver("d2", 40.765, -73.9855, true)].into_iter().collect();
        let locator = FixedLocator::new("ghost", 0.1);
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.driver_id, DriverId::new("d2"));
    }

    #[test]
    fn locator_error_falls_back_to_scan() {
        let drivers: HashMap<_, _> = [driver("d1", 40.759, -73.9855, true)].into_iter().collect();
        let locator = FailingLocator;
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.driver_id, DriverId::new("d1"));
        assert_eq!(hit.path, MatchPath::Scan);
    }

    #[test]
    fn index_answer_beyond_radius_is_rejected() {
        let drivers: HashMap<_, _> = [driver("d1", 40.80, -73.9855, true)].into_iter().collect();
        let locator = FixedLocator::new("d1", 4.6);
        let exclude = HashSet::new();
        let p = pickup();
        assert!(
            find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
                .is_none()
        );
    }

    #[test]
    fn index_distance_is_recomputed_from_the_store() {
        // The index claims d1 is 100 m away; its last heartbeat is ~4.6 km out.
        let drivers: HashMap<_, _> = [
            driver("d1", 40.80, -73.9855, true),
            driver("d2", 40.765, -73.9855, true),
        ]
        .into_iter()
        .collect();
        let locator = FixedLocator::new("d1", 0.1);
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.driver_id, DriverId::new("d2"));
        assert_eq!(hit.path, MatchPath::Scan);
    }

    #[test]
    fn index_hit_reports_the_store_distance() {
        let drivers: HashMap<_, _> = [driver("d1", 40.765, -73.9855, true)].into_iter().collect();
        let locator = FixedLocator::new("d1", 0.0);
        let exclude = HashSet::new();
        let p = pickup();
        let hit = find_nearest_driver(&drivers, Some(&locator), &MatchQuery::new(&p, 3.0, &exclude))
            .expect("match");
        assert_eq!(hit.path, MatchPath::Index);
        assert!((hit.pickup_distance_km - 0.778).abs() < 0.01, "got {}", hit.pickup_distance_km);
    }
}
