//! Dispatch error taxonomy.

use thiserror::Error;

use crate::types::{DriverId, RideId, RideStatus};

/// Failure reported by an external port (geo index, durable mirror, event sink).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected write: {0}")]
    Rejected(String),

    #[error("no drivers in radius")]
    NoCandidate,
}

/// How a caller should treat a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    StateConflict,
    NoMatch,
    Dependency,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ride not found: {0}")]
    RideNotFound(RideId),

    #[error("driver not found: {0}")]
    DriverNotFound(DriverId),

    #[error("driver mismatch: ride {ride} is not assigned to {driver}")]
    DriverMismatch { ride: RideId, driver: DriverId },

    #[error("cannot {action} ride {ride} in status {from}")]
    InvalidTransition {
        ride: RideId,
        from: RideStatus,
        action: &'static str,
    },

    #[error("ride already finished: {0}")]
    AlreadyFinished(RideId),

    #[error("driver heartbeat too old: {0}")]
    StaleDriver(DriverId),

    #[error("no nearby drivers available")]
    NoDriversAvailable,

    #[error("persistence failure: {0}")]
    Persistence(#[source] PortError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RideNotFound(_) | Self::DriverNotFound(_) => ErrorKind::NotFound,
            Self::DriverMismatch { .. }
            | Self::InvalidTransition { .. }
            | Self::AlreadyFinished(_)
            | Self::StaleDriver(_) => ErrorKind::StateConflict,
            Self::NoDriversAvailable => ErrorKind::NoMatch,
            Self::Persistence(_) => ErrorKind::Dependency,
        }
    }

    /// Only a failed match is worth retrying as-is; a later heartbeat may add a driver.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NoMatch
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
