//! Authoritative driver and ride state.
//!
//! Every mutation runs under one exclusive lock for its full duration,
//! including best-effort calls to the geo index and the durable mirror, so a
//! ride transition and the matching driver flip are observed together.
//! Lock order is store, then idempotency cache; the cache never calls back
//! into the store and the hub is only fed after the lock is released.

mod history;
mod prune;

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{DispatchError, PortError, Result};
use crate::geo::GeoLocator;
use crate::idempotency::{IdempotencyCache, DEFAULT_IDEMPOTENCY_CAPACITY, DEFAULT_IDEMPOTENCY_TTL};
use crate::matching::{find_nearest_driver, MatchCandidate, MatchQuery};
use crate::persistence::{IdempotencyStore, Persistence};
use crate::telemetry::DispatchTelemetry;
use crate::types::{
    Coordinate, DriverId, DriverState, DriverStatus, PassengerId, Ride, RideEvent, RideEventKind,
    RideId, RideStatus, DRIVER_RADIUS_KM,
};

#[derive(Debug, Default)]
struct StoreState {
    drivers: HashMap<DriverId, DriverState>,
    rides: HashMap<RideId, Ride>,
    last_id_nanos: i64,
}

impl StoreState {
    /// `ride_<unix-nanos>`, strictly increasing even when the clock stalls.
    fn next_ride_id(&mut self, now: DateTime<Utc>) -> RideId {
        let nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let nanos = nanos.max(self.last_id_nanos.saturating_add(1));
        self.last_id_nanos = nanos;
        RideId::new(format!("ride_{nanos}"))
    }

    /// Release `driver` if it is still attached to `ride`.
    fn release_driver(&mut self, driver: &DriverId, ride: &RideId) -> Option<DriverState> {
        let state = self.drivers.get_mut(driver)?;
        if state.ride_id.as_ref() != Some(ride) {
            return None;
        }
        state.release();
        Some(state.clone())
    }
}

pub struct DispatchStore {
    state: RwLock<StoreState>,
    geo: Option<Arc<dyn GeoLocator>>,
    persistence: Option<Arc<dyn Persistence>>,
    durable_keys: Option<Arc<dyn IdempotencyStore>>,
    idempotency: IdempotencyCache,
    clock: Arc<dyn Clock>,
    radius_km: f64,
    telemetry: Arc<DispatchTelemetry>,
}

/// Wires the optional ports into a [`DispatchStore`]. Anything left unset is
/// simply disabled.
pub struct StoreBuilder {
    geo: Option<Arc<dyn GeoLocator>>,
    persistence: Option<Arc<dyn Persistence>>,
    durable_keys: Option<Arc<dyn IdempotencyStore>>,
    clock: Arc<dyn Clock>,
    radius_km: f64,
    idempotency_ttl: Duration,
    idempotency_capacity: NonZeroUsize,
    telemetry: Arc<DispatchTelemetry>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            geo: None,
            persistence: None,
            durable_keys: None,
            clock: Arc::new(SystemClock),
            radius_km: DRIVER_RADIUS_KM,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            idempotency_capacity: NonZeroUsize::new(DEFAULT_IDEMPOTENCY_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            telemetry: Arc::new(DispatchTelemetry::default()),
        }
    }
}

impl StoreBuilder {
    pub fn with_geo(mut self, geo: Arc<dyn GeoLocator>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_idempotency_store(mut self, keys: Arc<dyn IdempotencyStore>) -> Self {
        self.durable_keys = Some(keys);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_radius_km(mut self, radius_km: f64) -> Self {
        self.radius_km = radius_km;
        self
    }

    pub fn with_idempotency(mut self, ttl: Duration, capacity: NonZeroUsize) -> Self {
        self.idempotency_ttl = ttl;
        self.idempotency_capacity = capacity;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<DispatchTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> DispatchStore {
        DispatchStore {
            state: RwLock::new(StoreState::default()),
            idempotency: IdempotencyCache::with_clock(
                self.idempotency_ttl,
                self.idempotency_capacity,
                self.clock.clone(),
            ),
            geo: self.geo,
            persistence: self.persistence,
            durable_keys: self.durable_keys,
            clock: self.clock,
            radius_km: self.radius_km,
            telemetry: self.telemetry,
        }
    }
}

impl DispatchStore {
    /// Store with no geo index and no durable mirror.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    pub fn telemetry(&self) -> &Arc<DispatchTelemetry> {
        &self.telemetry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a heartbeat.
    ///
    /// Drivers without a ride become idle and available; drivers attached to
    /// a ride stay unavailable and move to `on_ride`. Only a failing durable
    /// mirror fails the call; the in-memory update and the geo upsert stand
    /// regardless.
    pub fn update_driver_location(
        &self,
        driver_id: &DriverId,
        location: Coordinate,
    ) -> Result<DriverState> {
        let mut state = self.write();
        let now = self.clock.now();

        let ride_id = state
            .drivers
            .get(driver_id)
            .and_then(|existing| existing.ride_id.clone());
        let mut driver = DriverState {
            id: driver_id.clone(),
            available: true,
            location,
            updated_at: now,
            ride_id: None,
            status: DriverStatus::Idle,
            radius_km: DRIVER_RADIUS_KM,
        };
        if let Some(ride_id) = ride_id {
            driver.attach(&ride_id, DriverStatus::OnRide);
        }
        state.drivers.insert(driver_id.clone(), driver.clone());

        if let Some(geo) = &self.geo {
            if let Err(error) = geo.add(driver_id, location.latitude, location.longitude) {
                debug!(driver = %driver_id, %error, "geo upsert failed");
            }
        }
        if let Some(persistence) = &self.persistence {
            persistence
                .save_driver(&driver)
                .map_err(DispatchError::Persistence)?;
        }
        Ok(driver)
    }

    /// Match a passenger to the nearest available driver.
    ///
    /// A non-empty `idempotency_key` seen before returns the original ride
    /// untouched. The new ride is mirrored before it becomes visible in
    /// memory, so a mirror failure leaves no trace anywhere.
    #[instrument(skip_all, fields(passenger = %passenger_id))]
    pub fn create_ride(
        &self,
        passenger_id: &PassengerId,
        pickup: Coordinate,
        idempotency_key: &str,
    ) -> Result<Ride> {
        let mut state = self.write();

        if let Some(ride) = self.replay_locked(&mut state, idempotency_key) {
            debug!(ride = %ride.id, "idempotent replay");
            return Ok(ride);
        }

        let candidate = self
            .match_locked(&state, &pickup, &HashSet::new())
            .ok_or(DispatchError::NoDriversAvailable)?;

        let now = self.clock.now();
        let ride = Ride {
            id: state.next_ride_id(now),
            passenger_id: passenger_id.clone(),
            driver_id: Some(candidate.driver_id.clone()),
            status: RideStatus::Assigned,
            pickup,
            created_at: now,
            revision: 1,
        };
        let mut driver = state
            .drivers
            .get(&candidate.driver_id)
            .cloned()
            .ok_or_else(|| DispatchError::DriverNotFound(candidate.driver_id.clone()))?;
        driver.attach(&ride.id, DriverStatus::Assigned);

        self.persist_new_ride(&ride, &driver, &candidate)?;

        state.drivers.insert(driver.id.clone(), driver);
        state.rides.insert(ride.id.clone(), ride.clone());
        self.remember_key(idempotency_key, &ride.id);
        self.telemetry.record_request();

        info!(
            ride = %ride.id,
            driver = %candidate.driver_id,
            dist_km = candidate.pickup_distance_km,
            "ride assigned"
        );
        Ok(ride)
    }

    /// Ride previously created under `key`, if any.
    pub fn lookup_idempotent(&self, key: &str) -> Option<Ride> {
        let mut state = self.write();
        self.replay_locked(&mut state, key)
    }

    /// Memory first, then the durable mirror; a mirror hit is backfilled.
    pub fn get_ride(&self, ride_id: &RideId) -> Option<Ride> {
        if let Some(ride) = self.read().rides.get(ride_id) {
            return Some(ride.clone());
        }
        let ride = self.mirror_lookup(ride_id)?;
        let mut state = self.write();
        Some(state.rides.entry(ride_id.clone()).or_insert(ride).clone())
    }

    pub fn accept_ride(&self, ride_id: &RideId, driver_id: &DriverId) -> Result<(Ride, RideStatus)> {
        let mut state = self.write();
        let ride = state
            .rides
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))?;
        if !ride.is_assigned_to(driver_id) {
            return Err(DispatchError::DriverMismatch {
                ride: ride_id.clone(),
                driver: driver_id.clone(),
            });
        }
        if ride.status != RideStatus::Assigned {
            return Err(DispatchError::InvalidTransition {
                ride: ride_id.clone(),
                from: ride.status,
                action: "accept",
            });
        }

        let previous = ride.status;
        ride.status = RideStatus::Accepted;
        ride.revision += 1;
        let ride = ride.clone();

        let driver = state.drivers.get_mut(driver_id).map(|driver| {
            driver.attach(ride_id, DriverStatus::Accepted);
            driver.clone()
        });

        self.persist_transition(&ride, driver.as_ref(), previous, RideEventKind::RideAccepted);
        self.telemetry.record_accept();
        info!(ride = %ride_id, driver = %driver_id, "ride accepted");
        Ok((ride, previous))
    }

    /// Cancel from any non-terminal status, releasing the attached driver.
    pub fn cancel_ride(&self, ride_id: &RideId) -> Result<(Ride, RideStatus)> {
        let mut state = self.write();
        let ride = state
            .rides
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))?;
        if ride.status.is_terminal() {
            return Err(DispatchError::AlreadyFinished(ride_id.clone()));
        }

        let previous = ride.status;
        ride.status = RideStatus::Cancelled;
        ride.revision += 1;
        let ride = ride.clone();

        let driver = ride
            .driver_id
            .as_ref()
            .and_then(|driver| state.release_driver(driver, ride_id));

        self.persist_transition(&ride, driver.as_ref(), previous, RideEventKind::RideCancelled);
        self.telemetry.record_cancel();
        info!(ride = %ride_id, from = %previous, "ride cancelled");
        Ok((ride, previous))
    }

    pub fn complete_ride(&self, ride_id: &RideId) -> Result<(Ride, RideStatus)> {
        let mut state = self.write();
        let ride = state
            .rides
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))?;
        if !ride.status.in_progress() {
            return Err(DispatchError::InvalidTransition {
                ride: ride_id.clone(),
                from: ride.status,
                action: "complete",
            });
        }

        let previous = ride.status;
        ride.status = RideStatus::Complete;
        ride.revision += 1;
        let ride = ride.clone();

        let driver = ride
            .driver_id
            .as_ref()
            .and_then(|driver| state.release_driver(driver, ride_id));

        self.persist_transition(&ride, driver.as_ref(), previous, RideEventKind::RideCompleted);
        self.telemetry.record_complete();
        info!(ride = %ride_id, "ride completed");
        Ok((ride, previous))
    }

    /// `accepted` to `en_route`; the driver moves to `on_ride`.
    pub fn mark_en_route(&self, ride_id: &RideId) -> Result<(Ride, RideStatus)> {
        let mut state = self.write();
        let ride = state
            .rides
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))?;
        if ride.status != RideStatus::Accepted {
            return Err(DispatchError::InvalidTransition {
                ride: ride_id.clone(),
                from: ride.status,
                action: "start",
            });
        }

        let previous = ride.status;
        ride.status = RideStatus::EnRoute;
        ride.revision += 1;
        let ride = ride.clone();

        let driver = ride.driver_id.as_ref().and_then(|driver_id| {
            let driver = state.drivers.get_mut(driver_id)?;
            driver.attach(ride_id, DriverStatus::OnRide);
            Some(driver.clone())
        });

        if let Some(persistence) = &self.persistence {
            let mirrored = mirror_status(persistence.as_ref(), &ride, driver.iter());
            if let Err(error) = mirrored {
                warn!(ride = %ride_id, %error, "en_route not mirrored");
            }
        }
        debug!(ride = %ride_id, "ride en route");
        Ok((ride, previous))
    }

    /// Hand a ride nobody accepted to another driver.
    ///
    /// Does nothing (`changed == false`) unless the ride is still `assigned`
    /// to `expected`. Otherwise `expected` is released and matching runs again
    /// without them; with nobody in range the ride falls back to `requested`.
    #[instrument(skip_all, fields(ride = %ride_id, expected = %expected))]
    pub fn reassign_if_unaccepted(
        &self,
        ride_id: &RideId,
        expected: &DriverId,
    ) -> Result<(Ride, bool)> {
        let mut state = self.write();
        let ride = state
            .rides
            .get(ride_id)
            .cloned()
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))?;
        if ride.status != RideStatus::Assigned || !ride.is_assigned_to(expected) {
            return Ok((ride, false));
        }

        let mut touched = Vec::with_capacity(2);
        if let Some(released) = state.release_driver(expected, ride_id) {
            touched.push(released);
        }

        let exclude: HashSet<DriverId> = [expected.clone()].into_iter().collect();
        let candidate = self.match_locked(&state, &ride.pickup, &exclude);

        let mut ride = ride;
        ride.revision += 1;
        match &candidate {
            Some(candidate) => {
                ride.driver_id = Some(candidate.driver_id.clone());
                if let Some(next) = state.drivers.get_mut(&candidate.driver_id) {
                    next.attach(ride_id, DriverStatus::Assigned);
                    touched.push(next.clone());
                }
                info!(driver = %candidate.driver_id, "ride reassigned");
            }
            None => {
                ride.status = RideStatus::Requested;
                ride.driver_id = None;
                info!("no replacement driver, ride back to requested");
            }
        }
        state.rides.insert(ride_id.clone(), ride.clone());

        if let Some(persistence) = &self.persistence {
            if let Err(error) = mirror_ride(persistence.as_ref(), &ride, touched.iter()) {
                warn!(%error, "reassignment not mirrored");
            }
        }
        Ok((ride, true))
    }

    /// Copy of one driver's state.
    pub fn driver(&self, driver_id: &DriverId) -> Option<DriverState> {
        self.read().drivers.get(driver_id).cloned()
    }

    /// Copy of every driver, in no particular order.
    pub fn drivers(&self) -> Vec<DriverState> {
        self.read().drivers.values().cloned().collect()
    }

    pub fn ride_count(&self) -> usize {
        self.read().rides.len()
    }

    fn match_locked(
        &self,
        state: &StoreState,
        pickup: &Coordinate,
        exclude: &HashSet<DriverId>,
    ) -> Option<MatchCandidate> {
        let started = Instant::now();
        let query = MatchQuery::new(pickup, self.radius_km, exclude);
        let candidate = find_nearest_driver(&state.drivers, self.geo.as_deref(), &query);
        self.telemetry.record_match_latency(started.elapsed());
        candidate
    }

    fn replay_locked(&self, state: &mut StoreState, key: &str) -> Option<Ride> {
        if key.is_empty() {
            return None;
        }
        let ride_id = match self.idempotency.lookup(key) {
            Some(ride_id) => ride_id,
            None => {
                let durable = self.durable_keys.as_ref()?;
                match durable.lookup(key) {
                    Ok(Some(ride_id)) => {
                        self.idempotency.remember(key, &ride_id);
                        ride_id
                    }
                    Ok(None) => return None,
                    Err(error) => {
                        warn!(%error, "durable idempotency lookup failed");
                        return None;
                    }
                }
            }
        };
        if let Some(ride) = state.rides.get(&ride_id) {
            return Some(ride.clone());
        }
        let ride = self.mirror_lookup(&ride_id)?;
        state.rides.insert(ride_id, ride.clone());
        Some(ride)
    }

    fn mirror_lookup(&self, ride_id: &RideId) -> Option<Ride> {
        let persistence = self.persistence.as_ref()?;
        match persistence.get_ride(ride_id) {
            Ok(ride) => ride,
            Err(error) => {
                warn!(ride = %ride_id, %error, "mirror lookup failed");
                None
            }
        }
    }

    fn remember_key(&self, key: &str, ride_id: &RideId) {
        if key.is_empty() {
            return;
        }
        self.idempotency.remember(key, ride_id);
        if let Some(durable) = &self.durable_keys {
            if let Err(error) = durable.remember(key, ride_id) {
                warn!(ride = %ride_id, %error, "durable idempotency write failed");
            }
        }
    }

    fn persist_new_ride(
        &self,
        ride: &Ride,
        driver: &DriverState,
        candidate: &MatchCandidate,
    ) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        match persistence.transactional() {
            Some(tx) => {
                let event = RideEvent::new(
                    ride.id.clone(),
                    RideEventKind::RideAssigned,
                    json!({
                        "statusTo": ride.status,
                        "driverId": driver.id,
                        "distKm": candidate.pickup_distance_km,
                    }),
                    ride.created_at,
                );
                tx.create_ride_with_event(ride, &event, driver)
                    .map_err(DispatchError::Persistence)?;
                self.telemetry.record_event();
            }
            None => {
                persistence
                    .save_ride(ride)
                    .and_then(|()| {
                        persistence.set_driver_ride(
                            &driver.id,
                            driver.ride_id.as_ref(),
                            driver.status,
                            driver.available,
                        )
                    })
                    .map_err(DispatchError::Persistence)?;
            }
        }
        Ok(())
    }

    /// Mirror a status transition; failures are logged, memory stays authoritative.
    fn persist_transition(
        &self,
        ride: &Ride,
        driver: Option<&DriverState>,
        previous: RideStatus,
        kind: RideEventKind,
    ) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = match persistence.transactional() {
            Some(tx) => {
                let event = RideEvent::new(
                    ride.id.clone(),
                    kind,
                    json!({ "statusFrom": previous, "statusTo": ride.status }),
                    self.clock.now(),
                );
                tx.update_ride_with_event(ride, &event, driver)
                    .map(|()| self.telemetry.record_event())
            }
            None => mirror_status(persistence.as_ref(), ride, driver.into_iter()),
        };
        if let Err(error) = result {
            warn!(ride = %ride.id, %error, event = kind.as_str(), "transition not mirrored");
        }
    }
}

impl Default for DispatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("DispatchStore")
            .field("drivers", &state.drivers.len())
            .field("rides", &state.rides.len())
            .field("radius_km", &self.radius_km)
            .field("geo", &self.geo.is_some())
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

fn mirror_status<'a>(
    persistence: &dyn Persistence,
    ride: &Ride,
    drivers: impl Iterator<Item = &'a DriverState>,
) -> std::result::Result<(), PortError> {
    persistence.update_ride_status(&ride.id, ride.status)?;
    mirror_drivers(persistence, drivers)
}

fn mirror_ride<'a>(
    persistence: &dyn Persistence,
    ride: &Ride,
    drivers: impl Iterator<Item = &'a DriverState>,
) -> std::result::Result<(), PortError> {
    persistence.save_ride(ride)?;
    mirror_drivers(persistence, drivers)
}

fn mirror_drivers<'a>(
    persistence: &dyn Persistence,
    drivers: impl Iterator<Item = &'a DriverState>,
) -> std::result::Result<(), PortError> {
    for driver in drivers {
        persistence.set_driver_ride(
            &driver.id,
            driver.ride_id.as_ref(),
            driver.status,
            driver.available,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::geo::ScanLocator;
    use crate::persistence::MemoryMirror;

    const PICKUP: (f64, f64) = (40.758, -73.9855);

    fn store_with_clock() -> (DispatchStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = DispatchStore::builder().with_clock(clock.clone()).build();
        (store, clock)
    }

    fn at(clock: &ManualClock, lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon, clock.now())
    }

    fn pickup(clock: &ManualClock) -> Coordinate {
        at(clock, PICKUP.0, PICKUP.1)
    }

    #[test]
    fn heartbeat_keeps_attached_driver_busy() {
        let (store, clock) = store_with_clock();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("heartbeat");
        let ride = store
            .create_ride(&"p1".into(), pickup(&clock), "")
            .expect("ride");

        let driver = store.update_driver_location(&d1, pickup(&clock)).expect("heartbeat");
        assert!(!driver.available);
        assert_eq!(driver.status, DriverStatus::OnRide);
        assert_eq!(driver.ride_id, Some(ride.id));
    }

    #[test]
    fn ride_ids_are_strictly_increasing_under_a_frozen_clock() {
        let (store, clock) = store_with_clock();
        store.update_driver_location(&"d1".into(), pickup(&clock)).expect("d1");
        store.update_driver_location(&"d2".into(), pickup(&clock)).expect("d2");
        let first = store.create_ride(&"p1".into(), pickup(&clock), "").expect("first");
        let second = store.create_ride(&"p2".into(), pickup(&clock), "").expect("second");
        assert_ne!(first.id, second.id);
        assert!(first.id.as_str().starts_with("ride_"));
    }

    #[test]
    fn accept_rejects_wrong_driver_and_wrong_status() {
        let (store, clock) = store_with_clock();
        store.update_driver_location(&"d1".into(), pickup(&clock)).expect("d1");
        let ride = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");

        let err = store.accept_ride(&ride.id, &"d9".into()).expect_err("mismatch");
        assert!(matches!(err, DispatchError::DriverMismatch { .. }));

        store.accept_ride(&ride.id, &"d1".into()).expect("accept");
        let err = store.accept_ride(&ride.id, &"d1".into()).expect_err("twice");
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn complete_requires_progress() {
        let (store, clock) = store_with_clock();
        store.update_driver_location(&"d1".into(), pickup(&clock)).expect("d1");
        let ride = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");
        let err = store.complete_ride(&ride.id).expect_err("not accepted");
        assert!(matches!(
            err,
            DispatchError::InvalidTransition { from: RideStatus::Assigned, .. }
        ));
    }

    #[test]
    fn en_route_then_complete_releases_driver() {
        let (store, clock) = store_with_clock();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("d1");
        let ride = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");
        store.accept_ride(&ride.id, &d1).expect("accept");

        let (started, previous) = store.mark_en_route(&ride.id).expect("en route");
        assert_eq!(previous, RideStatus::Accepted);
        assert_eq!(started.status, RideStatus::EnRoute);
        assert_eq!(store.driver(&d1).map(|d| d.status), Some(DriverStatus::OnRide));

        let (done, previous) = store.complete_ride(&ride.id).expect("complete");
        assert_eq!(previous, RideStatus::EnRoute);
        assert_eq!(done.status, RideStatus::Complete);
        assert!(store.driver(&d1).is_some_and(|d| d.available && d.is_consistent()));
    }

    #[test]
    fn cancel_is_refused_once_finished() {
        let (store, clock) = store_with_clock();
        store.update_driver_location(&"d1".into(), pickup(&clock)).expect("d1");
        let ride = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");
        let (cancelled, previous) = store.cancel_ride(&ride.id).expect("cancel");
        assert_eq!(previous, RideStatus::Assigned);
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert!(store.driver(&"d1".into()).is_some_and(|d| d.available));

        let err = store.cancel_ride(&ride.id).expect_err("already cancelled");
        assert!(matches!(err, DispatchError::AlreadyFinished(_)));
    }

    #[test]
    fn revisions_increase_with_each_transition() {
        let (store, clock) = store_with_clock();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("d1");
        let created = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");
        let (accepted, _) = store.accept_ride(&created.id, &d1).expect("accept");
        let (done, _) = store.complete_ride(&created.id).expect("complete");
        assert!(created.revision < accepted.revision);
        assert!(accepted.revision < done.revision);
    }

    #[test]
    fn failing_mirror_rejects_new_ride_without_side_effects() {
        let clock = Arc::new(ManualClock::default());
        let mirror = Arc::new(MemoryMirror::with_clock(clock.clone(), DEFAULT_IDEMPOTENCY_TTL));
        let store = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_persistence(mirror.clone())
            .build();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("d1");

        mirror.set_failing(true);
        let err = store
            .create_ride(&"p1".into(), pickup(&clock), "key-1")
            .expect_err("mirror down");
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert_eq!(store.ride_count(), 0);
        assert!(store.driver(&d1).is_some_and(|d| d.available));
        assert!(store.lookup_idempotent("key-1").is_none());
    }

    #[test]
    fn failing_mirror_surfaces_on_heartbeat_but_memory_updates() {
        let clock = Arc::new(ManualClock::default());
        let mirror = Arc::new(MemoryMirror::new());
        let locator = Arc::new(ScanLocator::with_clock(clock.clone()));
        let store = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_persistence(mirror.clone())
            .with_geo(locator.clone())
            .build();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("d1");

        // Mirror down while d1 drives ~10 km north.
        mirror.set_failing(true);
        let moved = at(&clock, PICKUP.0 + 0.09, PICKUP.1);
        let err = store
            .update_driver_location(&d1, moved)
            .expect_err("mirror down");
        assert!(matches!(err, DispatchError::Persistence(_)));
        assert_eq!(store.driver(&d1).map(|d| d.location), Some(moved));

        let hit = locator
            .nearby(moved.latitude, moved.longitude, 0.5)
            .expect("index follows the heartbeat");
        assert_eq!(hit.driver_id, d1);

        mirror.set_failing(false);
        let err = store
            .create_ride(&"p1".into(), pickup(&clock), "")
            .expect_err("d1 is out of range now");
        assert!(matches!(err, DispatchError::NoDriversAvailable));
    }

    #[test]
    fn transitions_emit_audit_events_through_the_transactional_port() {
        let clock = Arc::new(ManualClock::default());
        let mirror = Arc::new(MemoryMirror::with_clock(clock.clone(), DEFAULT_IDEMPOTENCY_TTL));
        let store = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_persistence(mirror.clone())
            .build();
        let d1 = DriverId::new("d1");
        store.update_driver_location(&d1, pickup(&clock)).expect("d1");
        let ride = store.create_ride(&"p1".into(), pickup(&clock), "").expect("ride");
        store.accept_ride(&ride.id, &d1).expect("accept");
        store.cancel_ride(&ride.id).expect("cancel");

        let kinds: Vec<_> = mirror.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RideEventKind::RideAssigned,
                RideEventKind::RideAccepted,
                RideEventKind::RideCancelled
            ]
        );
        assert_eq!(mirror.ride(&ride.id).map(|r| r.status), Some(RideStatus::Cancelled));
        assert_eq!(store.telemetry().snapshot().events_logged, 3);
    }

    #[test]
    fn get_ride_backfills_from_mirror() {
        let mirror = Arc::new(MemoryMirror::new());
        let store = DispatchStore::builder().with_persistence(mirror.clone()).build();
        let now = Utc::now();
        let ride = Ride {
            id: RideId::new("ride_42"),
            passenger_id: PassengerId::new("p1"),
            driver_id: None,
            status: RideStatus::Complete,
            pickup: Coordinate::new(PICKUP.0, PICKUP.1, now),
            created_at: now,
            revision: 3,
        };
        mirror.insert_ride(ride.clone());

        assert_eq!(store.ride_count(), 0);
        assert_eq!(store.get_ride(&ride.id), Some(ride));
        assert_eq!(store.ride_count(), 1);
    }

    #[test]
    fn durable_key_survives_cache_loss() {
        let clock = Arc::new(ManualClock::default());
        let mirror = Arc::new(MemoryMirror::with_clock(clock.clone(), DEFAULT_IDEMPOTENCY_TTL));
        let first = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_persistence(mirror.clone())
            .with_idempotency_store(mirror.clone())
            .build();
        first.update_driver_location(&"d1".into(), pickup(&clock)).expect("d1");
        let ride = first.create_ride(&"p1".into(), pickup(&clock), "key-1").expect("ride");

        // Fresh process: empty memory, same mirror.
        let second = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_persistence(mirror.clone())
            .with_idempotency_store(mirror)
            .build();
        clock.advance(ChronoDuration::seconds(5));
        let replay = second
            .create_ride(&"p1".into(), pickup(&clock), "key-1")
            .expect("replay");
        assert_eq!(replay.id, ride.id);
    }
}
