//! Spawn-point registry
//!
//! Tracks known spawn locations, the learned despawn cycle used to
//! predict expiry for sightings whose time-to-despawn the API withholds,
//! and candidate points discovered during crawling for future scheduling.

use dashmap::{DashMap, DashSet};

use crate::geo::{round_coords, Point};
use crate::types::SpawnId;

/// Seconds in one spawn cycle. Despawn offsets repeat hourly.
const CYCLE_SECS: u64 = 3_600;

#[derive(Debug, Default)]
pub struct SpawnRegistry {
    /// Spawn id -> learned despawn offset within the hourly cycle.
    despawn_offsets: DashMap<SpawnId, u64>,
    /// Rounded coordinates of spawn points already known to the scheduler.
    known_points: DashSet<(i64, i64)>,
    /// Unseen candidate points collected by extra-discovery mode.
    discovered: DashSet<(i64, i64)>,
}

impl SpawnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a learned despawn offset (second-of-cycle) for a spawn.
    pub fn learn(&self, spawn_id: SpawnId, despawn_offset: u64) {
        self.despawn_offsets
            .insert(spawn_id, despawn_offset % CYCLE_SECS);
    }

    /// Predicted despawn time (epoch seconds) for a sighting seen at
    /// `seen`, or `None` when the spawn's cycle is unknown.
    pub fn despawn_time(&self, spawn_id: &SpawnId, seen: u64) -> Option<u64> {
        let offset = *self.despawn_offsets.get(spawn_id)?;
        let cycle_start = seen - seen % CYCLE_SECS;
        let mut despawn = cycle_start + offset;
        if despawn <= seen {
            despawn += CYCLE_SECS;
        }
        Some(despawn)
    }

    pub fn add_known_point(&self, point: Point) {
        self.known_points.insert(round_coords(point, 4));
    }

    /// Whether the scheduler already covers this point.
    pub fn have_point(&self, point: Point) -> bool {
        self.known_points.contains(&round_coords(point, 4))
    }

    /// Collect an unseen candidate point. Returns whether it was new.
    pub fn discover(&self, point: Point) -> bool {
        self.discovered.insert(round_coords(point, 4))
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_spawn_yields_no_prediction() {
        let registry = SpawnRegistry::new();
        assert_eq!(registry.despawn_time(&SpawnId::Id(1), 1_000), None);
    }

    #[test]
    fn prediction_lands_after_seen_time() {
        let registry = SpawnRegistry::new();
        let id = SpawnId::Id(42);
        registry.learn(id.clone(), 600);

        // Seen before the offset within the hour: same cycle.
        let seen = 7_200 + 100;
        assert_eq!(registry.despawn_time(&id, seen), Some(7_200 + 600));

        // Seen after the offset: next cycle.
        let seen = 7_200 + 700;
        assert_eq!(registry.despawn_time(&id, seen), Some(7_200 + 600 + 3_600));
    }

    #[test]
    fn discovery_deduplicates() {
        let registry = SpawnRegistry::new();
        let p = (40.71281, -74.00604);
        assert!(registry.discover(p));
        // Same point within rounding: not new.
        assert!(!registry.discover((40.71283, -74.00603)));
        assert_eq!(registry.discovered_count(), 1);
    }

    #[test]
    fn known_points_round() {
        let registry = SpawnRegistry::new();
        registry.add_known_point((40.5, -73.5));
        assert!(registry.have_point((40.50002, -73.50004)));
        assert!(!registry.have_point((40.51, -73.5)));
    }
}
