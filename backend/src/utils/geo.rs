//! Great-circle distance and the lat/lon grid used to bucket searchers.

use crate::constants::EARTH_RADIUS_KM;
use crate::models::GeoPoint;

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = 111.32;

/// Haversine distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Grid cell keyed by truncated lat/lon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridCell {
    pub lat: i32,
    pub lon: i32,
}

impl GridCell {
    pub fn containing(point: GeoPoint, cell_degrees: f64) -> Self {
        Self {
            lat: (point.lat / cell_degrees).floor() as i32,
            lon: (point.lon / cell_degrees).floor() as i32,
        }
    }
}

/// Rectangle of grid cells. `lon == None` spans every longitude, which is
/// used near the poles and across the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub lat_min: i32,
    pub lat_max: i32,
    pub lon: Option<(i32, i32)>,
}

impl CellRange {
    pub fn contains(&self, cell: GridCell) -> bool {
        if cell.lat < self.lat_min || cell.lat > self.lat_max {
            return false;
        }
        match self.lon {
            Some((min, max)) => cell.lon >= min && cell.lon <= max,
            None => true,
        }
    }
}

/// Cells that may hold any point within `radius_km` of `center`.
pub fn covering_cells(center: GeoPoint, radius_km: f64, cell_degrees: f64) -> CellRange {
    let dlat = radius_km / KM_PER_DEGREE;
    let lat_lo = (center.lat - dlat).max(-90.0);
    let lat_hi = (center.lat + dlat).min(90.0);

    let widest_lat = lat_lo.abs().max(lat_hi.abs());
    let lon = if widest_lat >= 89.0 {
        None
    } else {
        let dlon = radius_km / (KM_PER_DEGREE * widest_lat.to_radians().cos());
        let lon_lo = center.lon - dlon;
        let lon_hi = center.lon + dlon;
        if lon_lo < -180.0 || lon_hi > 180.0 {
            None
        } else {
            Some((
                (lon_lo / cell_degrees).floor() as i32,
                (lon_hi / cell_degrees).floor() as i32,
            ))
        }
    };

    CellRange {
        lat_min: (lat_lo / cell_degrees).floor() as i32,
        lat_max: (lat_hi / cell_degrees).floor() as i32,
        lon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Berlin -> Paris is roughly 878km.
        let berlin = GeoPoint::new(52.5200, 13.4050);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = haversine_km(berlin, paris);
        assert!((d - 878.0).abs() < 10.0, "got {d}");
        assert_eq!(haversine_km(berlin, berlin), 0.0);
    }

    #[test]
    fn test_covering_cells_include_points_within_radius() {
        let center = GeoPoint::new(40.7128, -74.0060);
        let range = covering_cells(center, 5.0, 0.1);

        // ~2km north-east stays inside the range
        let nearby = GeoPoint::new(40.7280, -73.9900);
        assert!(haversine_km(center, nearby) < 5.0);
        assert!(range.contains(GridCell::containing(nearby, 0.1)));

        // ~100km away does not
        let far = GeoPoint::new(41.6, -74.0);
        assert!(!range.contains(GridCell::containing(far, 0.1)));
    }

    #[test]
    fn test_antimeridian_spans_all_longitudes() {
        let range = covering_cells(GeoPoint::new(0.0, 179.99), 20.0, 0.1);
        assert_eq!(range.lon, None);
        assert!(range.contains(GridCell::containing(GeoPoint::new(0.0, -179.99), 0.1)));
    }

    #[test]
    fn test_negative_coordinates_floor_into_cells() {
        let cell = GridCell::containing(GeoPoint::new(-0.05, -0.05), 0.1);
        assert_eq!(cell, GridCell { lat: -1, lon: -1 });
    }
}
