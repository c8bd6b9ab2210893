use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::PortError;
use crate::idempotency::DEFAULT_IDEMPOTENCY_TTL;
use crate::types::{
    DriverId, DriverState, DriverStatus, PassengerId, Ride, RideEvent, RideId, RideStatus,
};

use super::{
    newest_first, EventSink, IdempotencyStore, Page, Persistence, RideHistory, RideTransaction,
};

#[derive(Debug, Default)]
struct MirrorState {
    drivers: HashMap<DriverId, DriverState>,
    rides: HashMap<RideId, Ride>,
    events: Vec<RideEvent>,
    keys: HashMap<String, (RideId, DateTime<Utc>)>,
}

/// In-process stand-in for the durable backend.
///
/// Implements every port. Writes can be switched to fail so callers can
/// exercise the dependency-failure paths; reads keep working.
pub struct MemoryMirror {
    state: Mutex<MirrorState>,
    failing: AtomicBool,
    clock: Arc<dyn Clock>,
    key_ttl: chrono::Duration,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_IDEMPOTENCY_TTL)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, key_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MirrorState::default()),
            failing: AtomicBool::new(false),
            clock,
            key_ttl: chrono::Duration::from_std(key_ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Make every subsequent write fail with [`PortError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn ride(&self, id: &RideId) -> Option<Ride> {
        self.lock().rides.get(id).cloned()
    }

    pub fn driver(&self, id: &DriverId) -> Option<DriverState> {
        self.lock().drivers.get(id).cloned()
    }

    pub fn ride_count(&self) -> usize {
        self.lock().rides.len()
    }

    pub fn events(&self) -> Vec<RideEvent> {
        self.lock().events.clone()
    }

    /// Seed a ride directly, as if written by an earlier process.
    pub fn insert_ride(&self, ride: Ride) {
        self.lock().rides.insert(ride.id.clone(), ride);
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), PortError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("memory mirror offline".to_string()));
        }
        Ok(())
    }

    fn rides_where(&self, keep: impl Fn(&Ride) -> bool) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self
            .lock()
            .rides
            .values()
            .filter(|r| keep(*r))
            .cloned()
            .collect();
        newest_first(&mut rides);
        rides
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryMirror")
            .field("drivers", &state.drivers.len())
            .field("rides", &state.rides.len())
            .field("events", &state.events.len())
            .field("failing", &self.failing.load(Ordering::SeqCst))
            .finish()
    }
}

fn upsert_ride(rides: &mut HashMap<RideId, Ride>, ride: &Ride) {
    match rides.get_mut(&ride.id) {
        // Existing rows only take the mutable columns.
        Some(existing) => {
            existing.driver_id = ride.driver_id.clone();
            existing.status = ride.status;
            existing.revision = ride.revision;
        }
        None => {
            rides.insert(ride.id.clone(), ride.clone());
        }
    }
}

fn apply_driver_ride(
    drivers: &mut HashMap<DriverId, DriverState>,
    driver: &DriverId,
    ride: Option<&RideId>,
    status: DriverStatus,
    available: bool,
) {
    if let Some(row) = drivers.get_mut(driver) {
        row.ride_id = ride.cloned();
        row.status = status;
        row.available = available;
    }
}

impl Persistence for MemoryMirror {
    fn save_driver(&self, driver: &DriverState) -> Result<(), PortError> {
        self.check_writable()?;
        self.lock().drivers.insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    fn save_ride(&self, ride: &Ride) -> Result<(), PortError> {
        self.check_writable()?;
        upsert_ride(&mut self.lock().rides, ride);
        Ok(())
    }

    fn update_ride_status(&self, ride: &RideId, status: RideStatus) -> Result<(), PortError> {
        self.check_writable()?;
        if let Some(row) = self.lock().rides.get_mut(ride) {
            row.status = status;
        }
        Ok(())
    }

    fn set_driver_ride(
        &self,
        driver: &DriverId,
        ride: Option<&RideId>,
        status: DriverStatus,
        available: bool,
    ) -> Result<(), PortError> {
        self.check_writable()?;
        apply_driver_ride(&mut self.lock().drivers, driver, ride, status, available);
        Ok(())
    }

    fn get_ride(&self, ride: &RideId) -> Result<Option<Ride>, PortError> {
        Ok(self.lock().rides.get(ride).cloned())
    }

    fn transactional(&self) -> Option<&dyn RideTransaction> {
        Some(self)
    }
}

impl RideTransaction for MemoryMirror {
    fn create_ride_with_event(
        &self,
        ride: &Ride,
        event: &RideEvent,
        driver: &DriverState,
    ) -> Result<(), PortError> {
        self.check_writable()?;
        let mut state = self.lock();
        upsert_ride(&mut state.rides, ride);
        apply_driver_ride(
            &mut state.drivers,
            &driver.id,
            driver.ride_id.as_ref(),
            driver.status,
            driver.available,
        );
        state.events.push(event.clone());
        Ok(())
    }

    fn update_ride_with_event(
        &self,
        ride: &Ride,
        event: &RideEvent,
        driver: Option<&DriverState>,
    ) -> Result<(), PortError> {
        self.check_writable()?;
        let mut state = self.lock();
        if let Some(row) = state.rides.get_mut(&ride.id) {
            row.driver_id = ride.driver_id.clone();
            row.status = ride.status;
            row.revision = ride.revision;
        }
        if let Some(driver) = driver {
            apply_driver_ride(
                &mut state.drivers,
                &driver.id,
                driver.ride_id.as_ref(),
                driver.status,
                driver.available,
            );
        }
        state.events.push(event.clone());
        Ok(())
    }
}

impl IdempotencyStore for MemoryMirror {
    fn remember(&self, key: &str, ride: &RideId) -> Result<(), PortError> {
        if key.is_empty() || ride.as_str().is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.key_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.lock()
            .keys
            .insert(key.to_string(), (ride.clone(), expires_at));
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<RideId>, PortError> {
        if key.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now();
        Ok(self
            .lock()
            .keys
            .get(key)
            .filter(|(_, expires_at)| now <= *expires_at)
            .map(|(ride, _)| ride.clone()))
    }
}

impl EventSink for MemoryMirror {
    fn append(&self, event: &RideEvent) -> Result<(), PortError> {
        self.check_writable()?;
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn list(&self, ride: &RideId, page: Page) -> Result<Vec<RideEvent>, PortError> {
        let state = self.lock();
        let mut events: Vec<RideEvent> = state
            .events
            .iter()
            .filter(|e| &e.ride_id == ride)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(page.apply(events))
    }

    fn count(&self, ride: &RideId) -> Result<usize, PortError> {
        Ok(self.lock().events.iter().filter(|e| &e.ride_id == ride).count())
    }
}

impl RideHistory for MemoryMirror {
    fn list_by_passenger(
        &self,
        passenger: &PassengerId,
        page: Page,
    ) -> Result<Vec<Ride>, PortError> {
        Ok(page.apply(self.rides_where(|r| &r.passenger_id == passenger)))
    }

    fn count_by_passenger(&self, passenger: &PassengerId) -> Result<usize, PortError> {
        Ok(self.lock().rides.values().filter(|r| &r.passenger_id == passenger).count())
    }

    fn list_by_driver(&self, driver: &DriverId, page: Page) -> Result<Vec<Ride>, PortError> {
        Ok(page.apply(self.rides_where(|r| r.is_assigned_to(driver))))
    }

    fn count_by_driver(&self, driver: &DriverId) -> Result<usize, PortError> {
        Ok(self.lock().rides.values().filter(|r| r.is_assigned_to(driver)).count())
    }
}
