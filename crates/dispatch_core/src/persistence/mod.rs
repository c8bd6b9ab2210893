//! Ports to the durable side of the system.
//!
//! The store treats every port as optional: an absent port disables the
//! feature, it is never an error. Concrete database adapters live outside
//! this crate; [`MemoryMirror`] implements every port in memory.

mod memory;

use crate::error::PortError;
use crate::types::{
    DriverId, DriverState, DriverStatus, PassengerId, Ride, RideEvent, RideId, RideStatus,
};

pub use memory::MemoryMirror;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Simple mirror of driver and ride state.
pub trait Persistence: Send + Sync {
    fn save_driver(&self, driver: &DriverState) -> Result<(), PortError>;

    fn save_ride(&self, ride: &Ride) -> Result<(), PortError>;

    fn update_ride_status(&self, ride: &RideId, status: RideStatus) -> Result<(), PortError>;

    fn set_driver_ride(
        &self,
        driver: &DriverId,
        ride: Option<&RideId>,
        status: DriverStatus,
        available: bool,
    ) -> Result<(), PortError>;

    fn get_ride(&self, ride: &RideId) -> Result<Option<Ride>, PortError>;

    /// Richer atomic port, when the backend has one.
    fn transactional(&self) -> Option<&dyn RideTransaction> {
        None
    }
}

/// Ride + audit event + driver written as one unit.
pub trait RideTransaction: Send + Sync {
    fn create_ride_with_event(
        &self,
        ride: &Ride,
        event: &RideEvent,
        driver: &DriverState,
    ) -> Result<(), PortError>;

    fn update_ride_with_event(
        &self,
        ride: &Ride,
        event: &RideEvent,
        driver: Option<&DriverState>,
    ) -> Result<(), PortError>;
}

/// Durable idempotency keys, consulted after an in-memory miss.
pub trait IdempotencyStore: Send + Sync {
    fn remember(&self, key: &str, ride: &RideId) -> Result<(), PortError>;

    fn lookup(&self, key: &str) -> Result<Option<RideId>, PortError>;
}

/// Append-only ride audit log.
pub trait EventSink: Send + Sync {
    fn append(&self, event: &RideEvent) -> Result<(), PortError>;

    /// Events for one ride, oldest first.
    fn list(&self, ride: &RideId, page: Page) -> Result<Vec<RideEvent>, PortError>;

    fn count(&self, ride: &RideId) -> Result<usize, PortError>;
}

/// Paginated ride history, newest first.
pub trait RideHistory {
    fn list_by_passenger(&self, passenger: &PassengerId, page: Page)
        -> Result<Vec<Ride>, PortError>;

    fn count_by_passenger(&self, passenger: &PassengerId) -> Result<usize, PortError>;

    fn list_by_driver(&self, driver: &DriverId, page: Page) -> Result<Vec<Ride>, PortError>;

    fn count_by_driver(&self, driver: &DriverId) -> Result<usize, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    /// Clamp caller-supplied values: out-of-range limits fall back to the default.
    pub fn new(limit: usize, offset: usize) -> Self {
        let limit = if limit == 0 || limit > MAX_PAGE_LIMIT {
            DEFAULT_PAGE_LIMIT
        } else {
            limit
        };
        Self { limit, offset }
    }

    /// Parse raw query-string values; anything unparseable becomes the default.
    pub fn parse(limit: &str, offset: &str) -> Self {
        let limit = limit.trim().parse::<usize>().unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = offset.trim().parse::<usize>().unwrap_or(0);
        Self::new(limit, offset)
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// Newest-first ordering used by every history reader.
pub(crate) fn newest_first(rides: &mut [Ride]) {
    rides.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
