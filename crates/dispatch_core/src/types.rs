//! Core dispatch data model: drivers, rides, coordinates and their identifiers.
//!
//! These are plain values. The [`DispatchStore`](crate::store::DispatchStore) owns the
//! authoritative copies; everything handed out to callers is a snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed match radius carried on every driver record (km).
pub const DRIVER_RADIUS_KM: f64 = 3.0;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Driver identifier as supplied by the driver client.
    DriverId
);
string_id!(
    /// Ride identifier, issued by the store (`ride_<unix-nanos>`).
    RideId
);
string_id!(
    /// Passenger identifier.
    PassengerId
);

/// A point-in-time position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(rename = "timestamp")]
    pub at: DateTime<Utc>,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64, at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            at,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Idle,
    Assigned,
    Accepted,
    OnRide,
}

impl DriverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::OnRide => "on_ride",
        }
    }
}

/// Live state of one driver.
///
/// `available` is true exactly when `ride_id` is `None` and `status` is
/// [`DriverStatus::Idle`]; the store only changes these fields together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverState {
    pub id: DriverId,
    pub available: bool,
    pub location: Coordinate,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<RideId>,
    pub status: DriverStatus,
    pub radius_km: f64,
}

impl DriverState {
    /// Detach from any ride and become matchable again.
    pub(crate) fn release(&mut self) {
        self.ride_id = None;
        self.status = DriverStatus::Idle;
        self.available = true;
    }

    /// Attach to `ride` with the given busy status.
    pub(crate) fn attach(&mut self, ride: &RideId, status: DriverStatus) {
        debug_assert_ne!(status, DriverStatus::Idle, "attached drivers are never idle");
        self.ride_id = Some(ride.clone());
        self.status = status;
        self.available = false;
    }

    pub fn is_consistent(&self) -> bool {
        self.available == (self.ride_id.is_none() && self.status == DriverStatus::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Assigned,
    Accepted,
    EnRoute,
    Complete,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// States from which a ride may be completed.
    pub fn in_progress(self) -> bool {
        matches!(self, Self::Accepted | Self::EnRoute)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::EnRoute => "en_route",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    pub id: RideId,
    pub passenger_id: PassengerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    pub status: RideStatus,
    pub pickup: Coordinate,
    pub created_at: DateTime<Utc>,
    /// Bumped on every transition; lets subscribers discard stale snapshots.
    #[serde(default)]
    pub revision: u64,
}

impl Ride {
    pub fn is_assigned_to(&self, driver: &DriverId) -> bool {
        self.driver_id.as_ref() == Some(driver)
    }
}

/// Audit event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideEventKind {
    RideRequested,
    RideAssigned,
    RideAccepted,
    RideCancelled,
    RideCompleted,
    RideReassigned,
}

impl RideEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RideRequested => "ride_requested",
            Self::RideAssigned => "ride_assigned",
            Self::RideAccepted => "ride_accepted",
            Self::RideCancelled => "ride_cancelled",
            Self::RideCompleted => "ride_completed",
            Self::RideReassigned => "ride_reassigned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

/// Append-only audit record for one ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideEvent {
    pub ride_id: RideId,
    #[serde(rename = "type")]
    pub kind: RideEventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    pub created_at: DateTime<Utc>,
}

impl RideEvent {
    pub fn new(
        ride_id: RideId,
        kind: RideEventKind,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ride_id,
            kind,
            payload,
            actor: None,
            created_at,
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }
}
