use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use h3o::CellIndex;

use crate::clock::{Clock, SystemClock};
use crate::error::PortError;
use crate::spatial::{haversine_km, GeoIndex};
use crate::types::DriverId;

use super::{is_better, GeoLocator, NearbyDriver};

#[derive(Debug, Clone, Copy)]
struct Placement {
    cell: CellIndex,
    lat: f64,
    lon: f64,
    added_at: DateTime<Utc>,
}

/// H3 cell → driver mappings, updated incrementally as drivers move.
#[derive(Debug, Default)]
struct CellTable {
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    placements: HashMap<DriverId, Placement>,
}

impl CellTable {
    fn insert(&mut self, driver: &DriverId, placement: Placement) {
        if let Some(previous) = self.placements.insert(driver.clone(), placement) {
            if previous.cell == placement.cell {
                return;
            }
            self.detach(driver, previous.cell);
        }
        self.drivers_by_cell
            .entry(placement.cell)
            .or_default()
            .push(driver.clone());
    }

    fn remove(&mut self, driver: &DriverId) {
        if let Some(previous) = self.placements.remove(driver) {
            self.detach(driver, previous.cell);
        }
    }

    fn detach(&mut self, driver: &DriverId, cell: CellIndex) {
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.retain(|id| id != driver);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }
}

/// Geo-index locator backed by H3 cells.
///
/// A query walks the grid disk around the pickup cell, then re-ranks the
/// drivers found there by exact haversine distance, so the answer honours the
/// radius precisely even though the cells only approximate it.
pub struct CellLocator {
    geo: GeoIndex,
    table: RwLock<CellTable>,
    clock: Arc<dyn Clock>,
}

impl CellLocator {
    pub fn new(geo: GeoIndex) -> Self {
        Self::with_clock(geo, Arc::new(SystemClock))
    }

    pub fn with_clock(geo: GeoIndex, clock: Arc<dyn Clock>) -> Self {
        Self {
            geo,
            table: RwLock::new(CellTable::default()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .placements
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell the driver is currently indexed under.
    pub fn driver_cell(&self, driver: &DriverId) -> Option<CellIndex> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .placements
            .get(driver)
            .map(|p| p.cell)
    }
}

impl Default for CellLocator {
    fn default() -> Self {
        Self::new(GeoIndex::default())
    }
}

impl std::fmt::Debug for CellLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellLocator")
            .field("resolution", &self.geo.resolution())
            .field("drivers", &self.len())
            .finish()
    }
}

impl GeoLocator for CellLocator {
    fn nearby(&self, lat: f64, lon: f64, radius_km: f64) -> Result<NearbyDriver, PortError> {
        let origin = self
            .geo
            .cell_for(lat, lon)
            .ok_or_else(|| PortError::Rejected(format!("invalid coordinate ({lat}, {lon})")))?;
        let rings = self.geo.rings_for_radius(radius_km);

        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(&DriverId, f64)> = None;
        for cell in self.geo.grid_disk(origin, rings) {
            let Some(ids) = table.drivers_by_cell.get(&cell) else {
                continue;
            };
            for id in ids {
                let Some(placement) = table.placements.get(id) else {
                    continue;
                };
                let dist = haversine_km(lat, lon, placement.lat, placement.lon);
                if dist <= radius_km && is_better(dist, id, best) {
                    best = Some((id, dist));
                }
            }
        }
        best.map(|(id, distance_km)| NearbyDriver {
            driver_id: id.clone(),
            distance_km,
        })
        .ok_or(PortError::NoCandidate)
    }

    fn add(&self, driver: &DriverId, lat: f64, lon: f64) -> Result<(), PortError> {
        let cell = self
            .geo
            .cell_for(lat, lon)
            .ok_or_else(|| PortError::Rejected(format!("invalid coordinate ({lat}, {lon})")))?;
        let placement = Placement {
            cell,
            lat,
            lon,
            added_at: self.clock.now(),
        };
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(driver, placement);
        Ok(())
    }

    fn remove(&self, driver: &DriverId) -> Result<(), PortError> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(driver);
        Ok(())
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<DriverId> = table
            .placements
            .iter()
            .filter(|(_, p)| p.added_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            table.remove(&id);
        }
    }
}
