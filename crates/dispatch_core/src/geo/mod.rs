//! Geo locator port: "who is the nearest driver to this point?"
//!
//! Two implementations live here, [`ScanLocator`] (brute force) and
//! [`CellLocator`] (H3 cell index). The store never trusts either blindly;
//! see [`crate::matching`].

mod cell;
mod scan;

use chrono::{DateTime, Utc};

use crate::error::PortError;
use crate::types::DriverId;

pub use cell::CellLocator;
pub use scan::ScanLocator;

/// Nearest-neighbour answer from a locator.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_km: f64,
}

pub trait GeoLocator: Send + Sync {
    /// Nearest indexed driver within `radius_km`; [`PortError::NoCandidate`] when none.
    fn nearby(&self, lat: f64, lon: f64, radius_km: f64) -> Result<NearbyDriver, PortError>;

    fn add(&self, driver: &DriverId, lat: f64, lon: f64) -> Result<(), PortError>;

    fn remove(&self, driver: &DriverId) -> Result<(), PortError>;

    fn prune_older_than(&self, cutoff: DateTime<Utc>);
}

/// Which locator to wire into the store at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoBackend {
    #[default]
    Scan,
    Cell,
}

/// Strict "closer, or equally close with a smaller id" ordering shared by
/// every nearest-driver search so ties resolve the same way everywhere.
pub(crate) fn is_better(
    distance_km: f64,
    driver: &DriverId,
    best: Option<(&DriverId, f64)>,
) -> bool {
    match best {
        None => true,
        Some((best_id, best_km)) => {
            distance_km < best_km || (distance_km == best_km && driver < best_id)
        }
    }
}
