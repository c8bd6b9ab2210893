use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::persistence::EventSink;
use crate::telemetry::DispatchTelemetry;
use crate::types::{Actor, Ride, RideEvent, RideEventKind};

/// Best-effort writer of ride audit events that happen outside the store
/// (`ride_requested`, `ride_reassigned`). Without a sink it does nothing.
#[derive(Clone)]
pub struct RideJournal {
    sink: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<DispatchTelemetry>,
}

impl RideJournal {
    pub fn new(
        sink: Option<Arc<dyn EventSink>>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        Self {
            sink,
            clock,
            telemetry,
        }
    }

    pub fn record(
        &self,
        ride: &Ride,
        kind: RideEventKind,
        payload: serde_json::Value,
        actor: Option<Actor>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut event = RideEvent::new(ride.id.clone(), kind, payload, self.clock.now());
        event.actor = actor;
        match sink.append(&event) {
            Ok(()) => self.telemetry.record_event(),
            Err(error) => warn!(ride = %ride.id, event = kind.as_str(), %error, "event not logged"),
        }
    }
}

impl std::fmt::Debug for RideJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RideJournal")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
