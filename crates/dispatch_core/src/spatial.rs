//! Spatial operations: great-circle distance and H3 cell helpers.
//!
//! This module provides:
//!
//! - **Haversine distance** between two lat/lon points in kilometres
//! - **GeoIndex**: H3 resolution wrapper used by the cell locator
//! - **Ring sizing**: how many grid rings cover a search radius
//!
//! Default resolution is 8 (~0.5 km edge), coarse enough that a 3 km pickup
//! radius stays within a handful of rings.

use h3o::{CellIndex, LatLng, Resolution};

use crate::types::Coordinate;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points given in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + phi1.cos() * phi2.cos() * sin_dlon * sin_dlon;
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn distance_km(a: &Coordinate, b: &Coordinate) -> f64 {
    haversine_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

#[derive(Debug, Clone, Copy)]
pub struct GeoIndex {
    resolution: Resolution,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Cell containing the point, or `None` for out-of-range coordinates.
    pub fn cell_for(&self, lat: f64, lon: f64) -> Option<CellIndex> {
        LatLng::new(lat, lon)
            .ok()
            .map(|point| point.to_cell(self.resolution))
    }

    /// Number of grid rings around a cell needed to cover `radius_km`.
    ///
    /// Each ring adds at least `1.5 * edge` of guaranteed coverage (the hexagon
    /// apothem in the worst direction); one extra ring covers a query point
    /// sitting on the edge of its own cell.
    pub fn rings_for_radius(&self, radius_km: f64) -> u32 {
        let spacing = self.resolution.edge_length_km() * 1.5;
        if radius_km <= 0.0 || spacing <= 0.0 {
            return 1;
        }
        (radius_km / spacing).ceil() as u32 + 1
    }

    pub fn grid_disk(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        debug_assert_eq!(
            origin.resolution(),
            self.resolution,
            "origin resolution must match GeoIndex resolution"
        );
        origin.grid_disk::<Vec<_>>(k)
    }
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self {
            resolution: Resolution::Eight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_km(40.758, -73.9855, 40.758, -73.9855), 0.0);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Times Square to Grand Central, roughly 0.9 km.
        let d = haversine_km(40.7580, -73.9855, 40.7527, -73.9772);
        assert!((d - 0.92).abs() < 0.1, "unexpected distance {d}");
        // One degree of latitude is ~111 km everywhere.
        let d = haversine_km(10.0, 20.0, 11.0, 20.0);
        assert!((d - 111.19).abs() < 0.1, "unexpected distance {d}");
    }

    #[test]
    fn grid_disk_returns_neighbors_within_k() {
        let geo = GeoIndex::default();
        let origin = geo.cell_for(40.758, -73.9855).expect("valid point");
        let cells = geo.grid_disk(origin, 1);

        assert!(cells.contains(&origin));
        assert_eq!(cells.len(), 7);
        for cell in cells {
            let distance = origin.grid_distance(cell).expect("grid distance");
            assert!(distance <= 1);
        }
    }

    #[test]
    fn rings_grow_with_radius() {
        let geo = GeoIndex::default();
        assert!(geo.rings_for_radius(3.0) > geo.rings_for_radius(0.5));
        assert_eq!(geo.rings_for_radius(0.0), 1);
    }

    #[test]
    fn invalid_coordinates_have_no_cell() {
        let geo = GeoIndex::default();
        assert!(geo.cell_for(f64::NAN, 0.0).is_none());
    }
}
