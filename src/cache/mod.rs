//! Observation Caches
//!
//! Short-lived, per-kind membership sets shared by every worker. They gate
//! what gets forwarded downstream: within an entry's retention window, at
//! most one record per identity is emitted unless its payload materially
//! changed (a raid boss resolving, a moved weather front).
//!
//! Eviction is never performed inline: each insertion schedules exactly
//! one deferred eviction with the [`evictor`] task. Eviction handlers are
//! guarded by the stored expiry, so a stale timer from an earlier
//! insertion can never remove a fresher entry early.

pub mod evictor;

use dashmap::{DashMap, DashSet};

use crate::config::defaults::{CACHE_TOLERANCE_SECS, MYSTERY_RETENTION_SECS};
use crate::remote::FortData;
use crate::types::{Observation, RaidRecord, Sighting, SpawnId, WeatherRecord};
use evictor::{Eviction, EvictorHandle};

/// Identity of an unknown-expiry sighting.
pub type MysteryKey = (u64, SpawnId);

/// Bundle of all shared caches, one per observation kind.
#[derive(Debug)]
pub struct ObservationCaches {
    pub sightings: SightingCache,
    pub mysteries: MysteryCache,
    pub raids: RaidCache,
    pub forts: FortCache,
    pub weather: WeatherCache,
}

impl ObservationCaches {
    pub fn new(evictor: EvictorHandle) -> Self {
        Self {
            sightings: SightingCache::new(evictor.clone()),
            mysteries: MysteryCache::new(evictor.clone()),
            raids: RaidCache::new(evictor),
            forts: FortCache::default(),
            weather: WeatherCache::default(),
        }
    }
}

// ============================================================================
// Sightings
// ============================================================================

/// Cache of timed sightings keyed by spawn identity.
///
/// Entries expire with the sighting itself.
#[derive(Debug)]
pub struct SightingCache {
    store: DashMap<SpawnId, u64>,
    evictor: EvictorHandle,
}

impl SightingCache {
    fn new(evictor: EvictorHandle) -> Self {
        Self {
            store: DashMap::new(),
            evictor,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Membership within the tolerance window. Candidates without a
    /// determined expiry never match.
    pub fn contains(&self, sighting: &Sighting) -> bool {
        let Some(expiry) = &sighting.expiry else {
            return false;
        };
        match self.store.get(&sighting.spawn_id) {
            Some(stored) => stored.abs_diff(expiry.expire_timestamp) < CACHE_TOLERANCE_SECS,
            None => false,
        }
    }

    /// Insert and schedule eviction at the sighting's expiry.
    pub fn add(&self, sighting: &Sighting) {
        let Some(expiry) = &sighting.expiry else {
            return;
        };
        self.store
            .insert(sighting.spawn_id.clone(), expiry.expire_timestamp);
        self.evictor.schedule(
            expiry.expire_timestamp,
            Eviction::Sighting(sighting.spawn_id.clone()),
        );
    }

    /// Remove an entry whose stored expiry has passed. Stale timers from
    /// earlier insertions leave fresher entries alone.
    pub fn evict_due(&self, spawn_id: &SpawnId, now: u64) {
        self.store
            .remove_if(spawn_id, |_, expire| *expire <= now);
    }
}

// ============================================================================
// Mysteries
// ============================================================================

/// Cache of unknown-expiry sightings keyed by (encounter, spawn).
///
/// Stores a first/last-seen pair; a membership hit refreshes `last`.
/// Eviction emits a single summary update when the two differ.
#[derive(Debug)]
pub struct MysteryCache {
    store: DashMap<MysteryKey, (u64, u64)>,
    evictor: EvictorHandle,
}

impl MysteryCache {
    fn new(evictor: EvictorHandle) -> Self {
        Self {
            store: DashMap::new(),
            evictor,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Membership check; refreshes the last-seen time on a hit.
    pub fn contains(&self, sighting: &Sighting) -> bool {
        let key = (sighting.encounter_id, sighting.spawn_id.clone());
        match self.store.get_mut(&key) {
            Some(mut entry) => {
                if sighting.seen > entry.1 {
                    entry.1 = sighting.seen;
                }
                true
            }
            None => false,
        }
    }

    pub fn add(&self, sighting: &Sighting) {
        let key = (sighting.encounter_id, sighting.spawn_id.clone());
        self.store.insert(key.clone(), (sighting.seen, sighting.seen));
        self.evictor.schedule(
            sighting.seen + MYSTERY_RETENTION_SECS,
            Eviction::Mystery(key),
        );
    }

    /// Remove a due entry. Returns the summary update to emit when the
    /// sighting was observed more than once.
    pub fn evict_due(&self, key: &MysteryKey, now: u64) -> Option<Observation> {
        let entry = self.store.get(key)?;
        let (first, last) = *entry;
        if first + MYSTERY_RETENTION_SECS > now {
            return None;
        }
        drop(entry);
        self.store.remove(key);
        (first != last).then(|| Observation::MysteryUpdate {
            encounter_id: key.0,
            spawn_id: key.1.clone(),
            first,
            last,
        })
    }
}

// ============================================================================
// Raids
// ============================================================================

/// Cache of active raids keyed by the hosting fort.
///
/// Membership compares the boss id when the candidate has one, so a boss
/// resolving from unknown to known misses the cache and the refreshed
/// record is re-emitted.
#[derive(Debug)]
pub struct RaidCache {
    store: DashMap<String, (u64, u16)>,
    evictor: EvictorHandle,
}

impl RaidCache {
    fn new(evictor: EvictorHandle) -> Self {
        Self {
            store: DashMap::new(),
            evictor,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Membership for a raw fort carrying raid info.
    pub fn contains(&self, fort: &FortData) -> bool {
        let Some(raid) = &fort.raid else {
            return false;
        };
        match self.store.get(&fort.id) {
            Some(stored) => {
                let (stored_end, stored_boss) = *stored;
                match raid.boss {
                    Some(boss) => {
                        stored_end.abs_diff(raid.raid_end_ms / 1000) < CACHE_TOLERANCE_SECS
                            && stored_boss == boss.pokemon_id
                    }
                    None => true,
                }
            }
            None => false,
        }
    }

    pub fn add(&self, raid: &RaidRecord) {
        self.store
            .insert(raid.fort_external_id.clone(), (raid.time_end, raid.pokemon_id));
        self.evictor
            .schedule(raid.time_end, Eviction::Raid(raid.fort_external_id.clone()));
    }

    pub fn evict_due(&self, fort_id: &str, now: u64) {
        self.store.remove_if(fort_id, |_, (end, _)| *end <= now);
    }
}

// ============================================================================
// Forts
// ============================================================================

/// Membership sets for structures already forwarded this run.
#[derive(Debug, Default)]
pub struct FortCache {
    gyms: DashSet<String>,
    pokestops: DashSet<String>,
}

impl FortCache {
    pub fn gym_known(&self, external_id: &str) -> bool {
        self.gyms.contains(external_id)
    }

    pub fn add_gym(&self, external_id: &str) {
        self.gyms.insert(external_id.to_string());
    }

    pub fn pokestop_known(&self, external_id: &str) -> bool {
        self.pokestops.contains(external_id)
    }

    pub fn add_pokestop(&self, external_id: &str) {
        self.pokestops.insert(external_id.to_string());
    }
}

// ============================================================================
// Weather
// ============================================================================

/// Per-cell climate cache; membership requires every field to match, so
/// any change re-emits.
#[derive(Debug, Default)]
pub struct WeatherCache {
    store: DashMap<u64, WeatherRecord>,
}

impl WeatherCache {
    pub fn contains(&self, record: &WeatherRecord) -> bool {
        match self.store.get(&record.s2_cell_id) {
            Some(stored) => *stored == *record,
            None => false,
        }
    }

    pub fn add(&self, record: &WeatherRecord) {
        self.store.insert(record.s2_cell_id, record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Expiry, Inference};

    fn handle() -> EvictorHandle {
        evictor::channel().0
    }

    fn timed_sighting(spawn: u64, expire: u64) -> Sighting {
        Sighting {
            encounter_id: spawn * 10,
            pokemon_id: 1,
            spawn_id: SpawnId::Id(spawn),
            lat: 0.0,
            lon: 0.0,
            seen: expire.saturating_sub(600),
            expiry: Some(Expiry {
                expire_timestamp: expire,
                time_till_hidden: 600.0,
                inference: Inference::Measured,
            }),
            display: None,
            encounter: None,
        }
    }

    fn mystery_sighting(spawn: u64, seen: u64) -> Sighting {
        Sighting {
            encounter_id: spawn * 10,
            pokemon_id: 1,
            spawn_id: SpawnId::Id(spawn),
            lat: 0.0,
            lon: 0.0,
            seen,
            expiry: None,
            display: None,
            encounter: None,
        }
    }

    #[test]
    fn sighting_membership_within_tolerance() {
        let cache = SightingCache::new(handle());
        let s = timed_sighting(1, 1_000);
        assert!(!cache.contains(&s));
        cache.add(&s);
        assert!(cache.contains(&s));
        // one second off: still the same observation
        assert!(cache.contains(&timed_sighting(1, 1_001)));
        // two seconds off: outside the window
        assert!(!cache.contains(&timed_sighting(1, 1_002)));
        // mystery candidates never match a timed entry
        assert!(!cache.contains(&mystery_sighting(1, 400)));
    }

    #[test]
    fn sighting_eviction_honors_stored_expiry() {
        let cache = SightingCache::new(handle());
        cache.add(&timed_sighting(1, 1_000));
        // timer fires early (stale): entry survives
        cache.evict_due(&SpawnId::Id(1), 999);
        assert!(cache.contains(&timed_sighting(1, 1_000)));
        cache.evict_due(&SpawnId::Id(1), 1_000);
        assert!(!cache.contains(&timed_sighting(1, 1_000)));
    }

    #[test]
    fn mystery_tracks_last_seen_and_summarizes() {
        let cache = MysteryCache::new(handle());
        let first = mystery_sighting(5, 100);
        cache.add(&first);

        // same identity seen again later: hit, last refreshed
        assert!(cache.contains(&mystery_sighting(5, 160)));

        let key = (50, SpawnId::Id(5));
        // not due yet
        assert!(cache
            .evict_due(&key, 100 + MYSTERY_RETENTION_SECS - 1)
            .is_none());
        assert_eq!(cache.len(), 1);

        let update = cache
            .evict_due(&key, 100 + MYSTERY_RETENTION_SECS)
            .expect("summary update");
        match update {
            Observation::MysteryUpdate { first, last, .. } => {
                assert_eq!(first, 100);
                assert_eq!(last, 160);
            }
            other => panic!("expected mystery update, got {:?}", other),
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn mystery_single_observation_emits_nothing() {
        let cache = MysteryCache::new(handle());
        cache.add(&mystery_sighting(5, 100));
        let key = (50, SpawnId::Id(5));
        assert!(cache
            .evict_due(&key, 100 + MYSTERY_RETENTION_SECS)
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn raid_membership_follows_boss_resolution() {
        use crate::remote::{FortKind, RaidBoss, RaidInfo};

        let cache = RaidCache::new(handle());
        let record = RaidRecord {
            external_id: 1,
            fort_external_id: "gym-1".to_string(),
            lat: 0.0,
            lon: 0.0,
            level: 5,
            pokemon_id: 0,
            move_1: 0,
            move_2: 0,
            time_spawn: 0,
            time_battle: 0,
            time_end: 9_000,
        };
        cache.add(&record);

        let mut fort = FortData {
            id: "gym-1".to_string(),
            kind: FortKind::Gym,
            latitude: 0.0,
            longitude: 0.0,
            enabled: true,
            last_modified_timestamp_ms: 0,
            cooldown_complete_timestamp_ms: 0,
            owned_by_team: 1,
            gym_points: 0,
            guard_pokemon_id: 0,
            slots_available: 0,
            lure: None,
            raid: Some(RaidInfo {
                raid_seed: 1,
                raid_level: 5,
                raid_spawn_ms: 0,
                raid_battle_ms: 0,
                raid_end_ms: 9_000_000,
                boss: None,
            }),
        };
        // boss still unknown: cached
        assert!(cache.contains(&fort));

        // boss resolved: cache must miss so the record is re-emitted
        fort.raid = Some(RaidInfo {
            raid_seed: 1,
            raid_level: 5,
            raid_spawn_ms: 0,
            raid_battle_ms: 0,
            raid_end_ms: 9_000_000,
            boss: Some(RaidBoss {
                pokemon_id: 384,
                move_1: 1,
                move_2: 2,
            }),
        });
        assert!(!cache.contains(&fort));
    }

    #[test]
    fn fort_and_weather_sets() {
        let forts = FortCache::default();
        assert!(!forts.gym_known("g"));
        forts.add_gym("g");
        assert!(forts.gym_known("g"));
        assert!(!forts.pokestop_known("g"));

        let weather = WeatherCache::default();
        let record = WeatherRecord {
            s2_cell_id: 11,
            condition: 2,
            alert_severity: 0,
            warn: false,
            day: 1,
        };
        assert!(!weather.contains(&record));
        weather.add(&record);
        assert!(weather.contains(&record));
        let changed = WeatherRecord {
            condition: 3,
            ..record.clone()
        };
        assert!(!weather.contains(&changed));
    }
}
