//! Request-level façade over the engine.
//!
//! Each operation does what a transport handler would: run the store
//! transition, then (lock released) publish to the hub, arm or disarm the
//! acceptance watchdog and log the audit events the store does not write
//! itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::geo::{CellLocator, GeoBackend, GeoLocator, ScanLocator};
use crate::hub::{Subscription, UpdateHub};
use crate::journal::RideJournal;
use crate::persistence::{EventSink, IdempotencyStore, MemoryMirror, Persistence};
use crate::spatial::GeoIndex;
use crate::store::DispatchStore;
use crate::telemetry::{DriverCounts, TelemetrySnapshot};
use crate::types::{Actor, Coordinate, DriverId, DriverState, PassengerId, Ride, RideEventKind, RideId};
use crate::watchdog::AcceptanceWatchdog;

/// Optional collaborators. Unset ports disable their feature.
#[derive(Clone, Default)]
pub struct Ports {
    pub persistence: Option<Arc<dyn Persistence>>,
    pub idempotency: Option<Arc<dyn IdempotencyStore>>,
    pub events: Option<Arc<dyn EventSink>>,
    pub geo: Option<Arc<dyn GeoLocator>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl Ports {
    /// Every durable port backed by one in-memory mirror.
    pub fn memory(mirror: Arc<MemoryMirror>) -> Self {
        Self {
            persistence: Some(mirror.clone()),
            idempotency: Some(mirror.clone()),
            events: Some(mirror),
            geo: None,
            clock: None,
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLocator>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// Locator selected by `backend`, reading time from `clock`.
pub fn build_locator(backend: GeoBackend, clock: Arc<dyn Clock>) -> Arc<dyn GeoLocator> {
    match backend {
        GeoBackend::Scan => Arc::new(ScanLocator::with_clock(clock)),
        GeoBackend::Cell => Arc::new(CellLocator::with_clock(GeoIndex::default(), clock)),
    }
}

pub struct DispatchService {
    store: Arc<DispatchStore>,
    hub: UpdateHub,
    watchdog: AcceptanceWatchdog,
    journal: RideJournal,
    freshness_ttl: Option<Duration>,
    driver_ttl: Duration,
}

impl DispatchService {
    /// Wire store, hub and watchdog from `config`. Returns the hub task so
    /// the caller can await it after cancelling `shutdown`.
    pub fn start(
        config: &DispatchConfig,
        ports: Ports,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let clock: Arc<dyn Clock> = match ports.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let geo = match ports.geo {
            Some(geo) => geo,
            None => build_locator(config.geo_backend, clock.clone()),
        };

        let mut builder = DispatchStore::builder()
            .with_clock(clock.clone())
            .with_geo(geo)
            .with_radius_km(config.match_radius_km)
            .with_idempotency(config.idempotency_ttl(), config.idempotency_capacity());
        if let Some(persistence) = ports.persistence {
            builder = builder.with_persistence(persistence);
        }
        if let Some(keys) = ports.idempotency {
            builder = builder.with_idempotency_store(keys);
        }
        let store = Arc::new(builder.build());

        let (hub, hub_task) = UpdateHub::spawn(config.subscriber_buffer, shutdown.clone());
        let journal = RideJournal::new(ports.events, clock, store.telemetry().clone());
        let watchdog = AcceptanceWatchdog::new(
            store.clone(),
            hub.clone(),
            journal.clone(),
            config.acceptance_window(),
            shutdown,
        );

        let service = Self {
            store,
            hub,
            watchdog,
            journal,
            freshness_ttl: config
                .enforce_fresh_heartbeat
                .then(|| config.driver_ttl()),
            driver_ttl: config.driver_ttl(),
        };
        (service, hub_task)
    }

    pub fn store(&self) -> &Arc<DispatchStore> {
        &self.store
    }

    pub fn hub(&self) -> &UpdateHub {
        &self.hub
    }

    pub fn watchdog(&self) -> &AcceptanceWatchdog {
        &self.watchdog
    }

    /// Location heartbeat; the position is forwarded to the driver's ride.
    pub fn heartbeat(&self, driver_id: &DriverId, location: Coordinate) -> Result<DriverState> {
        let driver = self.store.update_driver_location(driver_id, location)?;
        self.hub.publish_driver_update(&driver);
        Ok(driver)
    }

    /// Request a ride. A replayed idempotency key returns the original ride
    /// without publishing or arming anything again.
    pub fn request_ride(
        &self,
        passenger_id: &PassengerId,
        pickup: Coordinate,
        idempotency_key: &str,
    ) -> Result<Ride> {
        if let Some(ride) = self.store.lookup_idempotent(idempotency_key) {
            return Ok(ride);
        }
        let ride = self
            .store
            .create_ride(passenger_id, pickup, idempotency_key)?;

        self.hub.publish_ride_update(&ride);
        self.journal.record(
            &ride,
            RideEventKind::RideRequested,
            json!({
                "passengerId": ride.passenger_id,
                "driverId": ride.driver_id,
                "statusTo": ride.status,
            }),
            Some(Actor {
                id: passenger_id.to_string(),
                role: "passenger".to_string(),
            }),
        );
        self.watchdog.arm(&ride);
        Ok(ride)
    }

    /// Accept on behalf of `driver_id`. With the freshness gate on, a driver
    /// whose heartbeat is older than the driver TTL is refused.
    pub fn accept_ride(&self, ride_id: &RideId, driver_id: &DriverId) -> Result<Ride> {
        if let Some(ttl) = self.freshness_ttl {
            if !self.store.driver_is_fresh(driver_id, ttl) {
                return Err(DispatchError::StaleDriver(driver_id.clone()));
            }
        }
        let (ride, _previous) = self.store.accept_ride(ride_id, driver_id)?;
        self.watchdog.disarm(ride_id);
        self.hub.publish_ride_update(&ride);
        Ok(ride)
    }

    pub fn cancel_ride(&self, ride_id: &RideId) -> Result<Ride> {
        let (ride, _previous) = self.store.cancel_ride(ride_id)?;
        self.watchdog.disarm(ride_id);
        self.hub.publish_ride_update(&ride);
        Ok(ride)
    }

    pub fn complete_ride(&self, ride_id: &RideId) -> Result<Ride> {
        let (ride, _previous) = self.store.complete_ride(ride_id)?;
        self.watchdog.disarm(ride_id);
        self.hub.publish_ride_update(&ride);
        Ok(ride)
    }

    pub fn mark_en_route(&self, ride_id: &RideId) -> Result<Ride> {
        let (ride, _previous) = self.store.mark_en_route(ride_id)?;
        self.hub.publish_ride_update(&ride);
        Ok(ride)
    }

    pub fn ride(&self, ride_id: &RideId) -> Option<Ride> {
        self.store.get_ride(ride_id)
    }

    /// Live updates for an existing ride.
    pub fn subscribe(&self, ride_id: &RideId) -> Result<Subscription> {
        if self.store.get_ride(ride_id).is_none() {
            return Err(DispatchError::RideNotFound(ride_id.clone()));
        }
        Ok(self.hub.subscribe(ride_id))
    }

    /// One prune pass with the configured driver TTL.
    pub fn prune_cycle(&self) -> DriverCounts {
        prune_once(&self.store, self.driver_ttl)
    }

    /// Run [`Self::prune_cycle`] every `interval` until `shutdown` fires.
    pub fn spawn_pruner(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.driver_ttl;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        prune_once(&store, ttl);
                    }
                }
            }
        })
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.store.telemetry().snapshot()
    }
}

fn prune_once(store: &DispatchStore, ttl: Duration) -> DriverCounts {
    let removed = store.prune_stale_drivers(ttl);
    let counts = store.snapshot_drivers(ttl);
    if counts.available == 0 {
        warn!(
            total = counts.total,
            stale = counts.stale,
            "no available drivers after prune"
        );
    } else {
        debug!(removed, available = counts.available, "prune cycle");
    }
    counts
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("store", &self.store)
            .field("watchdog", &self.watchdog)
            .field("freshness_ttl", &self.freshness_ttl)
            .finish()
    }
}
