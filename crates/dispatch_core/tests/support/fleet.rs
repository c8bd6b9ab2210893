use dispatch_core::clock::Clock;
use dispatch_core::service::DispatchService;
use dispatch_core::store::DispatchStore;
use dispatch_core::test_helpers::{coordinate, offset_km, TIMES_SQUARE};
use dispatch_core::types::{Coordinate, DriverId, DriverState, PassengerId, Ride};

/// Heartbeat `id` at `north_km` / `east_km` from Times Square.
pub fn place_driver(
    store: &DispatchStore,
    clock: &dyn Clock,
    id: &str,
    north_km: f64,
    east_km: f64,
) -> DriverState {
    let point = offset_km(TIMES_SQUARE, north_km, east_km);
    store
        .update_driver_location(&DriverId::new(id), coordinate(clock, point))
        .expect("heartbeat")
}

pub fn heartbeat(service: &DispatchService, clock: &dyn Clock, id: &str, north_km: f64) -> DriverState {
    let point = offset_km(TIMES_SQUARE, north_km, 0.0);
    service
        .heartbeat(&DriverId::new(id), coordinate(clock, point))
        .expect("heartbeat")
}

pub fn pickup(clock: &dyn Clock) -> Coordinate {
    coordinate(clock, TIMES_SQUARE)
}

pub fn request(store: &DispatchStore, clock: &dyn Clock, passenger: &str, key: &str) -> Ride {
    store
        .create_ride(&PassengerId::new(passenger), pickup(clock), key)
        .expect("ride")
}
