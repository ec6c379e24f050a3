//! In-world interactions
//!
//! The optional sub-protocols a visit can run: detailed capture of a
//! creature, the fort spin sequence, bag cleaning, and egg incubation.
//! All of them move the agent believably (jitter, approach, settle
//! delays) before touching the remote endpoint.

use rand::Rng;
use tracing::{error, info, warn};

use super::call::{CallError, CallOptions};
use super::Worker;
use crate::clock;
use crate::config::defaults::{
    ENCOUNTER_APPROACH_M, ENCOUNTER_RANGE_M, ENCOUNTER_SETTLE_CAP_SECS, INFINITE_INCUBATOR_ITEM,
    SPIN_RANGE_M,
};
use crate::geo;
use crate::remote::{Action, FortData};
use crate::types::{EncounterDetails, Sighting, StatusCode};

impl Worker {
    /// Detailed-capture sub-request: approach if far, settle, request,
    /// and merge the returned attributes into the record. A missing
    /// payload is logged; the record stays unenriched.
    pub(crate) async fn encounter(
        &mut self,
        sighting: &mut Sighting,
        spawn_point_id: &str,
    ) -> Result<(), CallError> {
        self.set_code(StatusCode::Encountering);
        let target = (sighting.lat, sighting.lon);
        let distance = geo::distance_meters((self.session.lat, self.session.lon), target);

        let settle = if distance > ENCOUNTER_RANGE_M {
            // Advance proportionally toward the target, leaving a little
            // distance, and perturb altitude.
            let percent = 1.0 - ENCOUNTER_APPROACH_M / distance;
            let lat_change = (self.session.lat - sighting.lat) * percent;
            let lon_change = (self.session.lon - sighting.lon) * percent;
            self.session.lat -= lat_change;
            self.session.lon -= lon_change;
            self.session.altitude = rand::thread_rng()
                .gen_range(self.session.altitude - 2.0..=self.session.altitude + 2.0);
            self.api
                .set_position(self.session.lat, self.session.lon, self.session.altitude);
            ((distance * percent) / 8.0).min(ENCOUNTER_SETTLE_CAP_SECS)
        } else {
            self.simulate_jitter(0.00002);
            ENCOUNTER_SETTLE_CAP_SECS
        };

        self.random_sleep(settle, settle + 1.5).await;

        let responses = self
            .call(
                Action::Encounter {
                    encounter_id: sighting.encounter_id,
                    spawn_point_id: spawn_point_id.to_string(),
                    latitude: self.session.lat,
                    longitude: self.session.lon,
                },
                CallOptions {
                    action: Some(2.25),
                    ..CallOptions::default()
                },
            )
            .await?;

        match responses.encounter {
            Some(payload) => {
                sighting.encounter = Some(EncounterDetails {
                    move_1: payload.move_1,
                    move_2: payload.move_2,
                    individual_attack: payload.individual_attack,
                    individual_defense: payload.individual_defense,
                    individual_stamina: payload.individual_stamina,
                    height: payload.height_m,
                    weight: payload.weight_kg,
                    gender: payload.gender,
                });
            }
            None => error!("Missing detailed-capture response"),
        }
        Ok(())
    }

    /// Fort spin sequence with explicit result-code interpretation. A
    /// cooldown is stamped after every attempt regardless of outcome.
    pub(crate) async fn spin_pokestop(&mut self, fort: &FortData) -> Result<(), CallError> {
        self.set_code(StatusCode::Spinning);
        let fort_location = (fort.latitude, fort.longitude);
        let distance = geo::distance_meters((self.session.lat, self.session.lon), fort_location);
        let unit = self.ctx.config.scan.speed_unit;

        if distance > SPIN_RANGE_M || self.speed > unit.spin_speed_limit() {
            self.set_code(StatusCode::Visiting);
            return Ok(());
        }

        // Randomize location by up to ~1.5 meters.
        self.simulate_jitter(0.00001);

        let details = self
            .call(
                Action::FortDetails {
                    fort_id: fort.id.clone(),
                    latitude: fort.latitude,
                    longitude: fort.longitude,
                },
                CallOptions {
                    action: Some(1.2),
                    ..CallOptions::default()
                },
            )
            .await?;
        let name = details
            .fort_details
            .map(|d| d.name)
            .unwrap_or_else(|| fort.id.clone());

        let level_before = self.session.player_level;
        let responses = self
            .call(
                Action::FortSearch {
                    fort_id: fort.id.clone(),
                    player_latitude: self.session.lat,
                    player_longitude: self.session.lon,
                    fort_latitude: fort.latitude,
                    fort_longitude: fort.longitude,
                },
                CallOptions {
                    action: Some(2.0),
                    ..CallOptions::default()
                },
            )
            .await?;
        self.session.next_spin = clock::epoch() + self.ctx.config.spin.cooldown_secs;

        let Some(result) = responses.fort_search_result else {
            warn!(fort = %name, "Invalid spin response");
            self.set_code(StatusCode::Visiting);
            return Ok(());
        };

        match result {
            1 => {
                info!(fort = %name, "Spun fort");
                // Claim level rewards if the spin leveled the account up.
                if let Some(level) = self.session.player_level {
                    if level > level_before.unwrap_or(0) {
                        self.call(
                            Action::LevelUpRewards { level },
                            CallOptions::default(),
                        )
                        .await?;
                        info!(level, "Level up, claimed rewards");
                    }
                }
            }
            2 => info!(
                fort = %name,
                distance = %format!("{:.1}m", distance),
                speed = %format!("{:.1}{}", self.speed, unit.label()),
                "Fort reported out of spinning range"
            ),
            3 => warn!(fort = %name, "Fort was in its cooldown period"),
            4 => {
                warn!(
                    fort = %name,
                    bag = self.session.bag_items,
                    "Could not spin, inventory full"
                );
                self.session.inventory_timestamp = 0;
            }
            5 => {
                warn!(fort = %name, "Daily spin limit reached, disabling spins");
                self.session.spins_enabled = false;
            }
            code => warn!(fort = %name, code, "Spin failed with unrecognized code"),
        }
        self.set_code(StatusCode::Visiting);
        Ok(())
    }

    /// Recycle surplus items down to the configured per-item limits.
    pub(crate) async fn clean_bag(&mut self) -> Result<(), CallError> {
        self.set_code(StatusCode::CleaningBag);
        let limits = &self.ctx.config.inventory.item_limits;
        let mut surplus: Vec<(u16, u32)> = Vec::new();
        for (item, count) in &self.session.account.items {
            let Some(limit) = limits.get(item) else { continue };
            if count > limit {
                let discard = count - limit;
                let amount = if discard > 50 {
                    rand::thread_rng().gen_range(50..=discard)
                } else {
                    discard
                };
                surplus.push((*item, amount));
            }
        }

        let mut removed = 0;
        for (item_id, count) in surplus {
            let responses = self
                .call(
                    Action::RecycleItem { item_id, count },
                    CallOptions {
                        action: Some(2.0),
                        ..CallOptions::default()
                    },
                )
                .await?;
            if responses.recycle_result == Some(1) {
                removed += count;
            } else {
                warn!(item = item_id, "Failed to recycle item");
            }
        }
        info!(removed, "Cleaned bag");
        self.set_code(StatusCode::Visiting);
        Ok(())
    }

    /// Assign unused incubators to waiting eggs, longest-distance eggs
    /// first, preferring the unlimited incubator.
    pub(crate) async fn incubate_eggs(&mut self) -> Result<(), CallError> {
        self.set_code(StatusCode::Incubating);
        // Work on a copy: the inventory delta on each call mutates the
        // session's queue.
        let mut incubators = self.session.unused_incubators.clone();
        let mut waiting: Vec<_> = self
            .session
            .eggs
            .values()
            .filter(|egg| !egg.in_incubator)
            .cloned()
            .collect();
        waiting.sort_by(|a, b| a.km_target.total_cmp(&b.km_target));

        for egg in waiting {
            let Some(incubator) = incubators.pop_back() else { break };
            if incubator.item_id != INFINITE_INCUBATOR_ITEM && egg.km_target <= 9.0 {
                // Limited-use incubators are saved for long eggs.
                continue;
            }
            let responses = self
                .call(
                    Action::UseIncubator {
                        incubator_id: incubator.id,
                        egg_id: egg.id,
                    },
                    CallOptions {
                        action: Some(4.5),
                        ..CallOptions::default()
                    },
                )
                .await?;
            match responses.incubator_result {
                Some(1) => {
                    if let Some(state) = self.session.eggs.get_mut(&egg.id) {
                        state.in_incubator = true;
                    }
                }
                Some(4) => warn!("Incubator was already in use"),
                Some(code) => warn!(
                    incubator = incubator.id,
                    egg = egg.id,
                    code,
                    "Failed to apply incubator"
                ),
                None => error!("Invalid incubator response"),
            }
        }
        self.session.unused_incubators = incubators;
        self.set_code(StatusCode::Visiting);
        Ok(())
    }
}
