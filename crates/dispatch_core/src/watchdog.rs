//! Acceptance window enforcement.
//!
//! Every assignment arms one timer task. If the window elapses the task asks
//! the store to reassign; a reassignment to a new driver arms a fresh timer,
//! a fall back to `requested` arms nothing. Accepting, cancelling or
//! completing a ride disarms its timer. A timer that fires anyway (disarm
//! raced the wake-up) finds the ride out of `assigned` and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::UpdateHub;
use crate::journal::RideJournal;
use crate::store::DispatchStore;
use crate::types::{Actor, DriverId, Ride, RideEventKind, RideId, RideStatus};

pub const DEFAULT_ACCEPTANCE_WINDOW: Duration = Duration::from_secs(15);

struct Armed {
    generation: u64,
    driver: DriverId,
    token: CancellationToken,
}

#[derive(Default)]
struct Pending {
    next_generation: u64,
    rides: HashMap<RideId, Armed>,
}

struct Inner {
    store: Arc<DispatchStore>,
    hub: UpdateHub,
    journal: RideJournal,
    window: Duration,
    pending: Mutex<Pending>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct AcceptanceWatchdog {
    inner: Arc<Inner>,
}

impl AcceptanceWatchdog {
    pub fn new(
        store: Arc<DispatchStore>,
        hub: UpdateHub,
        journal: RideJournal,
        window: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                journal,
                window,
                pending: Mutex::new(Pending::default()),
                shutdown,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the window for `ride`'s current assignment, replacing any timer
    /// already pending for it. Rides that are not `assigned` are ignored.
    /// Must be called from within a Tokio runtime.
    pub fn arm(&self, ride: &Ride) {
        let Some(driver) = ride.driver_id.clone() else {
            return;
        };
        if ride.status != RideStatus::Assigned {
            return;
        }

        let token = self.inner.shutdown.child_token();
        let generation = {
            let mut pending = self.pending();
            pending.next_generation += 1;
            let generation = pending.next_generation;
            let armed = Armed {
                generation,
                driver: driver.clone(),
                token: token.clone(),
            };
            if let Some(previous) = pending.rides.insert(ride.id.clone(), armed) {
                previous.token.cancel();
            }
            generation
        };

        let watchdog = self.clone();
        let ride_id = ride.id.clone();
        let window = self.inner.window;
        debug!(ride = %ride_id, driver = %driver, ?window, "acceptance window armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(ride = %ride_id, "acceptance window disarmed");
                }
                _ = tokio::time::sleep(window) => {
                    watchdog.expire(&ride_id, &driver, generation);
                }
            }
        });
    }

    /// Cancel the pending timer for `ride_id`, if any.
    pub fn disarm(&self, ride_id: &RideId) {
        if let Some(armed) = self.pending().rides.remove(ride_id) {
            armed.token.cancel();
        }
    }

    /// Rides with a timer still pending.
    pub fn armed_count(&self) -> usize {
        self.pending().rides.len()
    }

    pub fn is_armed(&self, ride_id: &RideId) -> bool {
        self.pending().rides.contains_key(ride_id)
    }

    /// The window for (`ride_id`, `expected`) elapsed without acceptance.
    fn expire(&self, ride_id: &RideId, expected: &DriverId, generation: u64) {
        {
            let mut pending = self.pending();
            if pending
                .rides
                .get(ride_id)
                .is_some_and(|armed| armed.generation == generation)
            {
                pending.rides.remove(ride_id);
            }
        }

        let inner = &self.inner;
        let (ride, changed) = match inner.store.reassign_if_unaccepted(ride_id, expected) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(ride = %ride_id, %error, "acceptance timeout check failed");
                return;
            }
        };
        if !changed {
            inner.store.telemetry().record_accept_timeout();
            debug!(ride = %ride_id, status = %ride.status, "acceptance window closed, nothing to do");
            return;
        }

        inner.store.telemetry().record_reassignment();
        info!(
            ride = %ride_id,
            previous = %expected,
            next = ride.driver_id.as_ref().map_or("", |d| d.as_str()),
            status = %ride.status,
            "acceptance window expired"
        );
        inner.journal.record(
            &ride,
            RideEventKind::RideReassigned,
            json!({
                "previousDriver": expected,
                "newDriver": ride.driver_id,
                "statusTo": ride.status,
            }),
            Some(Actor {
                id: "dispatch".to_string(),
                role: "system".to_string(),
            }),
        );
        inner.hub.publish_ride_update(&ride);
        self.arm(&ride);
    }
}

impl std::fmt::Debug for AcceptanceWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptanceWatchdog")
            .field("window", &self.inner.window)
            .field("armed", &self.armed_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::hub::RideUpdate;
    use crate::persistence::{EventSink, MemoryMirror, Page};
    use crate::types::Coordinate;

    struct Rig {
        store: Arc<DispatchStore>,
        hub: UpdateHub,
        watchdog: AcceptanceWatchdog,
        events: Arc<MemoryMirror>,
    }

    fn rig() -> Rig {
        let store = Arc::new(DispatchStore::new());
        let shutdown = CancellationToken::new();
        let (hub, _task) = UpdateHub::spawn(16, shutdown.clone());
        let events = Arc::new(MemoryMirror::new());
        let journal = RideJournal::new(
            Some(events.clone()),
            Arc::new(SystemClock),
            store.telemetry().clone(),
        );
        let watchdog = AcceptanceWatchdog::new(
            store.clone(),
            hub.clone(),
            journal,
            DEFAULT_ACCEPTANCE_WINDOW,
            shutdown,
        );
        Rig {
            store,
            hub,
            watchdog,
            events,
        }
    }

    fn here() -> Coordinate {
        Coordinate::new(40.758, -73.9855, Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reassigns_and_rearms() {
        let rig = rig();
        rig.store.update_driver_location(&"d1".into(), here()).expect("d1");
        let ride = rig.store.create_ride(&"p1".into(), here(), "").expect("ride");
        rig.store
            .update_driver_location(&"d2".into(), Coordinate::new(40.760, -73.9855, Utc::now()))
            .expect("d2");
        let mut sub = rig.hub.subscribe(&ride.id);
        rig.watchdog.arm(&ride);

        tokio::time::sleep(Duration::from_secs(16)).await;

        let current = rig.store.get_ride(&ride.id).expect("ride");
        assert_eq!(current.driver_id, Some(DriverId::new("d2")));
        assert_eq!(current.status, RideStatus::Assigned);
        assert!(rig.watchdog.is_armed(&ride.id), "new assignment gets a new window");
        assert!(matches!(sub.recv().await, Some(RideUpdate::Ride(r)) if r.revision == current.revision));
        assert_eq!(rig.events.count(&ride.id), Ok(1));
        let logged = rig.events.list(&ride.id, Page::default()).expect("events");
        assert_eq!(logged[0].kind, RideEventKind::RideReassigned);
        assert_eq!(logged[0].payload["previousDriver"], "d1");
        assert_eq!(rig.store.telemetry().snapshot().reassignments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reversion_to_requested_does_not_rearm() {
        let rig = rig();
        rig.store.update_driver_location(&"d1".into(), here()).expect("d1");
        let ride = rig.store.create_ride(&"p1".into(), here(), "").expect("ride");
        rig.watchdog.arm(&ride);

        tokio::time::sleep(Duration::from_secs(16)).await;

        let current = rig.store.get_ride(&ride.id).expect("ride");
        assert_eq!(current.status, RideStatus::Requested);
        assert_eq!(current.driver_id, None);
        assert!(!rig.watchdog.is_armed(&ride.id));
        assert!(rig.store.driver(&"d1".into()).is_some_and(|d| d.available));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_reassignment() {
        let rig = rig();
        rig.store.update_driver_location(&"d1".into(), here()).expect("d1");
        rig.store.update_driver_location(&"d2".into(), here()).expect("d2");
        let ride = rig.store.create_ride(&"p1".into(), here(), "").expect("ride");
        rig.watchdog.arm(&ride);
        rig.watchdog.disarm(&ride.id);

        tokio::time::sleep(Duration::from_secs(30)).await;

        let current = rig.store.get_ride(&ride.id).expect("ride");
        assert_eq!(current.driver_id, ride.driver_id);
        assert_eq!(rig.watchdog.armed_count(), 0);
        assert_eq!(rig.store.telemetry().snapshot().accept_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_firing_after_accept_is_a_no_op() {
        let rig = rig();
        rig.store.update_driver_location(&"d1".into(), here()).expect("d1");
        rig.store.update_driver_location(&"d2".into(), here()).expect("d2");
        let ride = rig.store.create_ride(&"p1".into(), here(), "").expect("ride");
        let driver = ride.driver_id.clone().expect("assigned");
        rig.watchdog.arm(&ride);
        // Accepted without disarming: the timer still fires.
        rig.store.accept_ride(&ride.id, &driver).expect("accept");

        tokio::time::sleep(Duration::from_secs(16)).await;

        let current = rig.store.get_ride(&ride.id).expect("ride");
        assert_eq!(current.status, RideStatus::Accepted);
        assert_eq!(current.driver_id, Some(driver.clone()));
        assert_eq!(rig.store.driver(&driver).map(|d| d.available), Some(false));
        assert_eq!(rig.store.telemetry().snapshot().accept_timeouts, 1);
        assert_eq!(rig.events.count(&ride.id), Ok(0));
    }
}
