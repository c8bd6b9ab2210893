//! Test helpers for common test setup and utilities.
//!
//! Shared by unit tests, integration tests and benches so every scenario
//! starts from the same coordinates, clocks and stand-in locators.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::clock::{Clock, ManualClock};
use crate::error::PortError;
use crate::geo::{GeoLocator, NearbyDriver};
use crate::spatial::EARTH_RADIUS_KM;
use crate::store::DispatchStore;
use crate::types::{Coordinate, DriverId};

/// Pickup point used across scenarios: Times Square, Manhattan.
pub const TIMES_SQUARE: (f64, f64) = (40.758, -73.9855);

/// Fixed start instant for manual clocks (2024-01-01T08:00:00Z).
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(test_epoch()))
}

/// `(lat, lon)` displaced by `north_km` / `east_km` (flat-earth approximation,
/// accurate to a few metres over the distances tests use).
pub fn offset_km(origin: (f64, f64), north_km: f64, east_km: f64) -> (f64, f64) {
    let (lat, lon) = origin;
    let dlat = (north_km / EARTH_RADIUS_KM).to_degrees();
    let dlon = (east_km / (EARTH_RADIUS_KM * lat.to_radians().cos())).to_degrees();
    (lat + dlat, lon + dlon)
}

/// Coordinate sample stamped with `clock`'s current time.
pub fn coordinate(clock: &dyn Clock, point: (f64, f64)) -> Coordinate {
    Coordinate::new(point.0, point.1, clock.now())
}

/// Plain store reading time from a fresh manual clock.
pub fn store_with_clock() -> (DispatchStore, Arc<ManualClock>) {
    let clock = manual_clock();
    let store = DispatchStore::builder().with_clock(clock.clone()).build();
    (store, clock)
}

/// Panics unless every driver satisfies `available <=> no ride attached`.
pub fn assert_availability_invariant(store: &DispatchStore) {
    for driver in store.drivers() {
        assert_eq!(
            driver.available,
            driver.ride_id.is_none(),
            "driver {} available={} ride={:?}",
            driver.id,
            driver.available,
            driver.ride_id
        );
        assert!(driver.is_consistent(), "driver {} inconsistent", driver.id);
    }
}

/// Locator that is always down.
#[derive(Debug, Default)]
pub struct FailingLocator;

impl GeoLocator for FailingLocator {
    fn nearby(&self, _lat: f64, _lon: f64, _radius_km: f64) -> Result<NearbyDriver, PortError> {
        Err(PortError::Unavailable("geo index offline".to_string()))
    }

    fn add(&self, _driver: &DriverId, _lat: f64, _lon: f64) -> Result<(), PortError> {
        Err(PortError::Unavailable("geo index offline".to_string()))
    }

    fn remove(&self, _driver: &DriverId) -> Result<(), PortError> {
        Err(PortError::Unavailable("geo index offline".to_string()))
    }

    fn prune_older_than(&self, _cutoff: DateTime<Utc>) {}
}

/// Locator that always answers with the same candidate, whatever the query.
/// Stands in for a stale or partitioned index.
#[derive(Debug, Clone)]
pub struct FixedLocator {
    pub answer: NearbyDriver,
}

impl FixedLocator {
    pub fn new(driver: &str, distance_km: f64) -> Self {
        Self {
            answer: NearbyDriver {
                driver_id: DriverId::new(driver),
                distance_km,
            },
        }
    }
}

impl GeoLocator for FixedLocator {
    fn nearby(&self, _lat: f64, _lon: f64, _radius_km: f64) -> Result<NearbyDriver, PortError> {
        Ok(self.answer.clone())
    }

    fn add(&self, _driver: &DriverId, _lat: f64, _lon: f64) -> Result<(), PortError> {
        Ok(())
    }

    fn remove(&self, _driver: &DriverId) -> Result<(), PortError> {
        Ok(())
    }

    fn prune_older_than(&self, _cutoff: DateTime<Utc>) {}
}
