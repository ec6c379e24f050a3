//! Normalization
//!
//! Pure mappers from raw remote-API entities into canonical observation
//! records. No I/O, no shared state beyond the read-only despawn
//! predictor; everything here is deterministic given its inputs.

use crate::config::defaults::TTH_MAX_MS;
use crate::remote::{ClientWeather, FortData, WildCreature};
use crate::spawns::SpawnRegistry;
use crate::types::{
    Expiry, GymRecord, Inference, PokestopRecord, RaidRecord, Sighting, SpawnId, Team,
    WeatherRecord,
};

/// Normalize a wild creature.
///
/// A reported time-to-despawn in (0, 90000] ms is trusted as measured;
/// otherwise the spawn-point predictor is consulted, and failing that the
/// sighting has no expiry and travels as an unknown-expiry (mystery)
/// record.
pub fn creature(raw: &WildCreature, predictor: &SpawnRegistry, numeric_ids: bool) -> Sighting {
    let tsm = raw.last_modified_timestamp_ms;
    let seen = (tsm as f64 / 1000.0).round() as u64;
    let tth = raw.time_till_hidden_ms;
    let spawn_id = SpawnId::from_raw(&raw.spawn_point_id, numeric_ids);

    let expiry = if tth > 0 && tth <= TTH_MAX_MS {
        Some(Expiry {
            expire_timestamp: ((tsm as i64 + tth) as f64 / 1000.0).round() as u64,
            time_till_hidden: tth as f64 / 1000.0,
            inference: Inference::Measured,
        })
    } else {
        predictor.despawn_time(&spawn_id, seen).map(|despawn| Expiry {
            expire_timestamp: despawn,
            time_till_hidden: despawn.saturating_sub(seen) as f64,
            inference: Inference::Predicted,
        })
    };

    Sighting {
        encounter_id: raw.encounter_id,
        pokemon_id: raw.pokemon_id,
        spawn_id,
        lat: raw.latitude,
        lon: raw.longitude,
        seen,
        expiry,
        display: raw.display_form.filter(|&form| form != 0),
        encounter: None,
    }
}

/// Synthesize a sighting from a lured fort, keyed by the sentinel spawn
/// identity. Returns `None` when the fort carries no lure.
pub fn lured(raw: &FortData, now_ms: u64, numeric_ids: bool) -> Option<Sighting> {
    let lure = raw.lure.as_ref()?;
    Some(Sighting {
        encounter_id: lure.encounter_id,
        pokemon_id: lure.active_pokemon_id,
        spawn_id: SpawnId::lured(numeric_ids),
        lat: raw.latitude,
        lon: raw.longitude,
        seen: now_ms / 1000,
        expiry: Some(Expiry {
            expire_timestamp: lure.lure_expires_timestamp_ms / 1000,
            time_till_hidden: (lure.lure_expires_timestamp_ms.saturating_sub(now_ms)) as f64
                / 1000.0,
            inference: Inference::Lure,
        }),
        display: None,
        encounter: None,
    })
}

pub fn gym(raw: &FortData) -> GymRecord {
    GymRecord {
        external_id: raw.id.clone(),
        lat: raw.latitude,
        lon: raw.longitude,
        team: Team::from(raw.owned_by_team),
        prestige: raw.gym_points,
        guard_pokemon_id: raw.guard_pokemon_id,
        slots_available: raw.slots_available,
        last_modified: raw.last_modified_timestamp_ms / 1000,
    }
}

/// Normalize an active raid. Boss fields default to zero until the boss
/// is assigned. Returns `None` when the fort hosts no raid.
pub fn raid(raw: &FortData) -> Option<RaidRecord> {
    let info = raw.raid.as_ref()?;
    let boss = info.boss;
    Some(RaidRecord {
        external_id: info.raid_seed,
        fort_external_id: raw.id.clone(),
        lat: raw.latitude,
        lon: raw.longitude,
        level: info.raid_level,
        pokemon_id: boss.map_or(0, |b| b.pokemon_id),
        move_1: boss.map_or(0, |b| b.move_1),
        move_2: boss.map_or(0, |b| b.move_2),
        time_spawn: info.raid_spawn_ms / 1000,
        time_battle: info.raid_battle_ms / 1000,
        time_end: info.raid_end_ms / 1000,
    })
}

pub fn pokestop(raw: &FortData) -> PokestopRecord {
    PokestopRecord {
        external_id: raw.id.clone(),
        lat: raw.latitude,
        lon: raw.longitude,
    }
}

pub fn weather(raw: &ClientWeather) -> WeatherRecord {
    WeatherRecord {
        s2_cell_id: raw.s2_cell_id,
        condition: raw.condition,
        alert_severity: raw.alert_severity,
        warn: raw.warn,
        day: raw.day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FortKind, LureInfo, RaidBoss, RaidInfo};

    fn wild(tth_ms: i64) -> WildCreature {
        WildCreature {
            encounter_id: 99,
            spawn_point_id: "ab12".to_string(),
            pokemon_id: 143,
            latitude: 40.0,
            longitude: -74.0,
            last_modified_timestamp_ms: 1_700_000_000_000,
            time_till_hidden_ms: tth_ms,
            display_form: None,
        }
    }

    fn fort() -> FortData {
        FortData {
            id: "stop-1".to_string(),
            kind: FortKind::Pokestop,
            latitude: 40.0,
            longitude: -74.0,
            enabled: true,
            last_modified_timestamp_ms: 1_700_000_000_000,
            cooldown_complete_timestamp_ms: 0,
            owned_by_team: 0,
            gym_points: 0,
            guard_pokemon_id: 0,
            slots_available: 0,
            lure: None,
            raid: None,
        }
    }

    #[test]
    fn trusted_tth_is_measured_inclusive_bounds() {
        let predictor = SpawnRegistry::new();
        for tth in [1_i64, 90_000] {
            let sighting = creature(&wild(tth), &predictor, true);
            let expiry = sighting.expiry.expect("measured expiry");
            assert_eq!(expiry.inference, Inference::Measured);
            assert_eq!(
                expiry.expire_timestamp,
                ((1_700_000_000_000_i64 + tth) as f64 / 1000.0).round() as u64
            );
        }
    }

    #[test]
    fn untrusted_tth_without_prediction_is_mystery() {
        let predictor = SpawnRegistry::new();
        for tth in [0_i64, 90_001, -1] {
            let sighting = creature(&wild(tth), &predictor, true);
            assert!(sighting.expiry.is_none(), "tth {} should be mystery", tth);
        }
    }

    #[test]
    fn untrusted_tth_with_prediction_is_inferred() {
        let predictor = SpawnRegistry::new();
        predictor.learn(SpawnId::Id(0xab12), 1_200);
        let sighting = creature(&wild(0), &predictor, true);
        let expiry = sighting.expiry.expect("predicted expiry");
        assert_eq!(expiry.inference, Inference::Predicted);
        assert!(expiry.expire_timestamp > sighting.seen);
    }

    #[test]
    fn display_form_attached_only_when_present() {
        let predictor = SpawnRegistry::new();
        let mut raw = wild(1_000);
        assert!(creature(&raw, &predictor, true).display.is_none());
        raw.display_form = Some(3);
        assert_eq!(creature(&raw, &predictor, true).display, Some(3));
    }

    #[test]
    fn lured_fort_synthesizes_sentinel_sighting() {
        let mut f = fort();
        f.lure = Some(LureInfo {
            encounter_id: 7,
            active_pokemon_id: 16,
            lure_expires_timestamp_ms: 1_700_000_300_000,
        });
        let sighting = lured(&f, 1_700_000_000_000, true).expect("lure present");
        assert_eq!(sighting.spawn_id, SpawnId::lured(true));
        let expiry = sighting.expiry.expect("lure expiry");
        assert_eq!(expiry.inference, Inference::Lure);
        assert_eq!(expiry.expire_timestamp, 1_700_000_300);
        assert!((expiry.time_till_hidden - 300.0).abs() < f64::EPSILON);

        assert!(lured(&fort(), 0, true).is_none());
    }

    #[test]
    fn raid_without_boss_defaults_to_zero() {
        let mut f = fort();
        f.kind = FortKind::Gym;
        f.raid = Some(RaidInfo {
            raid_seed: 555,
            raid_level: 4,
            raid_spawn_ms: 1_000_000,
            raid_battle_ms: 2_000_000,
            raid_end_ms: 3_000_000,
            boss: None,
        });
        let record = raid(&f).expect("raid present");
        assert_eq!(record.pokemon_id, 0);
        assert_eq!(record.move_1, 0);
        assert_eq!(record.time_end, 3_000);

        f.raid = Some(RaidInfo {
            raid_seed: 556,
            raid_level: 4,
            raid_spawn_ms: 1_000_000,
            raid_battle_ms: 2_000_000,
            raid_end_ms: 3_000_000,
            boss: Some(RaidBoss {
                pokemon_id: 131,
                move_1: 2,
                move_2: 3,
            }),
        });
        assert_eq!(raid(&f).expect("raid present").pokemon_id, 131);
    }

    #[test]
    fn gym_field_mapping() {
        let mut f = fort();
        f.kind = FortKind::Gym;
        f.owned_by_team = 2;
        f.slots_available = 4;
        let record = gym(&f);
        assert_eq!(record.team, Team::Valor);
        assert_eq!(record.slots_available, 4);
        assert_eq!(record.last_modified, 1_700_000_000);
    }
}
