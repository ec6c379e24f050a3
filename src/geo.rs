//! Geographic helpers for the crawl engine
//!
//! Distance, positional jitter, operating bounds, and the quantized cell
//! cover used for map queries. Cell covers are cached per rounded point
//! because the same lattice points are visited over and over.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A latitude/longitude pair in decimal degrees.
pub type Point = (f64, f64);

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Grid step of one quantized map cell, in degrees (~550 m at the equator).
const CELL_STEP_DEG: f64 = 0.005;

// ============================================================================
// Distance & Units
// ============================================================================

/// Distance unit used for speed limits and status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Meters,
    Kilometers,
    Miles,
}

impl Units {
    /// Convert a distance in meters into this unit.
    pub fn from_meters(self, meters: f64) -> f64 {
        match self {
            Units::Meters => meters,
            Units::Kilometers => meters / 1_000.0,
            Units::Miles => meters / 1_609.344,
        }
    }

    /// Short label for log output.
    pub fn label(self) -> &'static str {
        match self {
            Units::Meters => "m/h",
            Units::Kilometers => "km/h",
            Units::Miles => "mph",
        }
    }

    /// Speed above which the remote endpoint refuses fort interaction,
    /// expressed in this unit per hour.
    pub fn spin_speed_limit(self) -> f64 {
        match self {
            Units::Meters => 34_000.0,
            Units::Kilometers => 34.0,
            Units::Miles => 21.0,
        }
    }
}

/// Great-circle distance between two points in meters (haversine).
pub fn distance_meters(a: Point, b: Point) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Distance between two points in the given unit.
pub fn distance(a: Point, b: Point, unit: Units) -> f64 {
    unit.from_meters(distance_meters(a, b))
}

/// Travel speed over a leg, expressed per hour.
///
/// Elapsed time is floored at the scan delay so a fresh session never
/// reports an absurd burst speed.
pub fn travel_speed(distance: f64, elapsed_secs: f64, floor_secs: f64) -> f64 {
    let elapsed = elapsed_secs.max(floor_secs);
    (distance / elapsed) * 3600.0
}

/// Randomize a point by up to `amount` degrees on each axis.
///
/// The default jitter amount used by workers is ~3 m; fort interaction uses
/// a tighter ~1.5 m jitter.
pub fn randomize_point(point: Point, amount: f64) -> Point {
    let mut rng = rand::thread_rng();
    (
        point.0 + rng.gen_range(-amount..=amount),
        point.1 + rng.gen_range(-amount..=amount),
    )
}

/// Round a point to the given number of decimal places.
pub fn round_coords(point: Point, precision: u32) -> (i64, i64) {
    let factor = 10_f64.powi(precision as i32);
    (
        (point.0 * factor).round() as i64,
        (point.1 * factor).round() as i64,
    )
}

// ============================================================================
// Operating Bounds
// ============================================================================

/// Rectangular operating boundary for the scan area.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Default for Bounds {
    /// A deliberately small sample area; real deployments set their own.
    fn default() -> Self {
        Self {
            north: 40.76,
            south: 40.75,
            east: -73.97,
            west: -73.99,
        }
    }
}

impl Bounds {
    pub fn contains(&self, point: Point) -> bool {
        point.0 <= self.north && point.0 >= self.south && point.1 <= self.east && point.1 >= self.west
    }

    pub fn center(&self) -> Point {
        ((self.north + self.south) / 2.0, (self.east + self.west) / 2.0)
    }

    /// Lattice of scan points covering the bounds at `step_deg` spacing.
    pub fn grid(&self, step_deg: f64) -> Vec<Point> {
        let mut points = Vec::new();
        let mut lat = self.south;
        while lat <= self.north {
            let mut lon = self.west;
            while lon <= self.east {
                points.push((lat, lon));
                lon += step_deg;
            }
            lat += step_deg;
        }
        points
    }
}

// ============================================================================
// Cell Cover
// ============================================================================

/// Identifiers of the 3x3 neighborhood of quantized cells around a point.
///
/// The remote map query wants explicit cell ids; the cover is deterministic
/// for a given rounded point.
pub fn cell_cover(point: Point) -> Vec<u64> {
    let base_lat = (point.0 / CELL_STEP_DEG).floor() as i64;
    let base_lon = (point.1 / CELL_STEP_DEG).floor() as i64;
    let mut ids = Vec::with_capacity(9);
    for dlat in -1..=1 {
        for dlon in -1..=1 {
            ids.push(cell_id(base_lat + dlat, base_lon + dlon));
        }
    }
    ids.sort_unstable();
    ids
}

/// Pack quantized cell coordinates into a stable 64-bit id.
fn cell_id(lat_idx: i64, lon_idx: i64) -> u64 {
    ((lat_idx as u64 & 0xFFFF_FFFF) << 32) | (lon_idx as u64 & 0xFFFF_FFFF)
}

/// Cache of computed cell covers keyed by rounded point.
#[derive(Debug, Default)]
pub struct CellCache {
    store: DashMap<(i64, i64), Arc<Vec<u64>>>,
    enabled: bool,
}

impl CellCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            store: DashMap::new(),
            enabled,
        }
    }

    /// Cell cover for a point, cached per 4-decimal rounding when enabled.
    pub fn cover(&self, point: Point) -> Arc<Vec<u64>> {
        if !self.enabled {
            return Arc::new(cell_cover(point));
        }
        let key = round_coords(point, 4);
        if let Some(hit) = self.store.get(&key) {
            return Arc::clone(&hit);
        }
        let ids = Arc::new(cell_cover(point));
        self.store.insert(key, Arc::clone(&ids));
        ids
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // ~111 km per degree of latitude
        let d = distance_meters((0.0, 0.0), (1.0, 0.0));
        assert!((d - 111_195.0).abs() < 200.0, "got {}", d);
    }

    #[test]
    fn unit_conversion() {
        assert!((Units::Kilometers.from_meters(1_500.0) - 1.5).abs() < f64::EPSILON);
        assert!((Units::Miles.from_meters(1_609.344) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bounds_contains() {
        let b = Bounds {
            north: 41.0,
            south: 40.0,
            east: -73.0,
            west: -74.0,
        };
        assert!(b.contains((40.5, -73.5)));
        assert!(!b.contains((41.5, -73.5)));
        assert!(!b.contains((40.5, -75.0)));
    }

    #[test]
    fn cell_cover_is_deterministic_and_cached() {
        let point = (40.7128, -74.0060);
        let cache = CellCache::new(true);
        let a = cache.cover(point);
        let b = cache.cover(point);
        assert_eq!(a, b);
        assert_eq!(a.len(), 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn speed_is_distance_over_elapsed_per_hour() {
        // one unit per second sustained for an hour
        let speed = travel_speed(3600.0, 3600.0, 10.0);
        assert!((speed - 3600.0).abs() < f64::EPSILON);
        assert!((speed / 3600.0 - 1.0).abs() < f64::EPSILON, "1 unit per second");
    }

    #[test]
    fn speed_clamps_elapsed_to_floor() {
        // 2 seconds elapsed with a 10 second floor behaves like 10 seconds
        let clamped = travel_speed(50.0, 2.0, 10.0);
        let floored = travel_speed(50.0, 10.0, 10.0);
        assert!((clamped - floored).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_stays_close() {
        let p = (40.0, -74.0);
        let q = randomize_point(p, 0.00002);
        assert!((p.0 - q.0).abs() <= 0.00002);
        assert!((p.1 - q.1).abs() <= 0.00002);
    }
}
