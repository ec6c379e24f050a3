//! Simulated remote backend
//!
//! Synthetic stand-in for the external client library, used when no real
//! transport is wired up. Map queries return randomized creatures and
//! forts around the queried point; authentication always succeeds after a
//! short delay. Lets the full fleet run end to end without network access.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    Action, ClientWeather, Credentials, EncounterPayload, FortData, FortDetailsData, FortKind,
    InventoryDelta, MapCell, MapObjects, PageData, PlayerData, QuotaSnapshot, RemoteApi,
    RemoteApiFactory, RemoteConfigData, RequestEnvelope, ResponseSet, SettingsData, WildCreature,
};
use crate::clock;

/// Quota period length advertised by the simulated authority, seconds.
const SIM_QUOTA_PERIOD: f64 = 60.0;

/// Shared state of the simulated backend.
#[derive(Debug)]
pub struct SimulatedBackend {
    maximum: u32,
    used: AtomicU32,
}

impl SimulatedBackend {
    pub fn new(maximum: u32) -> Arc<Self> {
        Arc::new(Self {
            maximum,
            used: AtomicU32::new(0),
        })
    }

    fn consume(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }
}

impl RemoteApiFactory for Arc<SimulatedBackend> {
    fn create(&self) -> Box<dyn RemoteApi> {
        Box::new(SimulatedApi {
            backend: Arc::clone(self),
            position: (0.0, 0.0, 0.0),
            proxy: None,
            authenticated: false,
        })
    }

    fn quota_status(&self) -> Option<QuotaSnapshot> {
        let now = clock::epoch();
        // The simulated period is aligned to wall-clock minutes; usage
        // resets implicitly when the period rolls over.
        let period_end = (now / SIM_QUOTA_PERIOD).floor() * SIM_QUOTA_PERIOD + SIM_QUOTA_PERIOD;
        let used = self.used.swap(0, Ordering::Relaxed).min(self.maximum);
        Some(QuotaSnapshot {
            maximum: self.maximum,
            remaining: self.maximum - used,
            period_end,
        })
    }
}

/// One simulated per-worker session.
pub struct SimulatedApi {
    backend: Arc<SimulatedBackend>,
    position: (f64, f64, f64),
    proxy: Option<String>,
    authenticated: bool,
}

impl SimulatedApi {
    fn map_objects(&self, latitude: f64, longitude: f64) -> MapObjects {
        let mut rng = rand::thread_rng();
        let now_ms = clock::epoch_ms();
        let mut cell = MapCell {
            current_timestamp_ms: now_ms,
            ..MapCell::default()
        };

        for _ in 0..rng.gen_range(0..4) {
            cell.wild_creatures.push(WildCreature {
                encounter_id: rng.gen(),
                spawn_point_id: format!("{:x}", rng.gen::<u32>()),
                pokemon_id: rng.gen_range(1..=400),
                latitude: latitude + rng.gen_range(-0.002..0.002),
                longitude: longitude + rng.gen_range(-0.002..0.002),
                last_modified_timestamp_ms: now_ms,
                // Roughly a third of sightings hide their despawn time.
                time_till_hidden_ms: if rng.gen_bool(0.66) {
                    rng.gen_range(1..=90_000)
                } else {
                    -1
                },
                display_form: None,
            });
        }

        for i in 0..rng.gen_range(0..3) {
            let gym = rng.gen_bool(0.3);
            cell.forts.push(FortData {
                id: format!("fort-{:.4}-{:.4}-{}", latitude, longitude, i),
                kind: if gym { FortKind::Gym } else { FortKind::Pokestop },
                latitude: latitude + rng.gen_range(-0.002..0.002),
                longitude: longitude + rng.gen_range(-0.002..0.002),
                enabled: rng.gen_bool(0.95),
                last_modified_timestamp_ms: now_ms,
                cooldown_complete_timestamp_ms: 0,
                owned_by_team: if gym { rng.gen_range(0..=3) } else { 0 },
                gym_points: 0,
                guard_pokemon_id: 0,
                slots_available: if gym { rng.gen_range(0..=6) } else { 0 },
                lure: None,
                raid: None,
            });
        }

        if rng.gen_bool(0.1) {
            cell.weather = Some(ClientWeather {
                s2_cell_id: rng.gen(),
                condition: rng.gen_range(0..=7),
                alert_severity: 0,
                warn: false,
                day: 1,
            });
        }

        MapObjects {
            status: 1,
            cells: vec![cell],
            time_of_day: 1,
        }
    }
}

#[async_trait]
impl RemoteApi for SimulatedApi {
    fn set_position(&mut self, lat: f64, lon: f64, altitude: f64) {
        self.position = (lat, lon, altitude);
    }

    fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    fn proxy(&self) -> Option<String> {
        self.proxy.clone()
    }

    fn restore_auth(&mut self, _token: &str, expiry: f64) -> bool {
        if expiry > clock::epoch() {
            self.authenticated = true;
            true
        } else {
            false
        }
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn auth_token(&self) -> Option<(String, f64)> {
        if self.authenticated {
            Some(("sim-token".to_string(), clock::epoch() + 7200.0))
        } else {
            None
        }
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> Result<(), super::RemoteError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.authenticated = true;
        Ok(())
    }

    async fn send(&mut self, envelope: RequestEnvelope) -> Result<ResponseSet, super::RemoteError> {
        if !self.authenticated {
            return Err(super::RemoteError::NotLoggedIn);
        }
        self.backend.consume();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut responses = ResponseSet::default();
        match envelope.action {
            Action::GetMapObjects {
                latitude, longitude, ..
            } => {
                responses.map_objects = Some(self.map_objects(latitude, longitude));
            }
            Action::GetPlayer { .. } => {
                responses.player = Some(PlayerData {
                    warn: false,
                    banned: false,
                    tutorial_state: vec![0, 1, 3, 4, 7],
                    max_item_storage: 350,
                    creation_timestamp_ms: clock::epoch_ms().saturating_sub(86_400_000),
                });
            }
            Action::DownloadRemoteConfig { .. } => {
                responses.remote_config = Some(RemoteConfigData::default());
            }
            Action::GetAssetDigest { page_offset, .. }
            | Action::DownloadItemTemplates { page_offset, .. } => {
                responses.page = Some(PageData {
                    result: 1,
                    page_offset,
                    timestamp_ms: clock::epoch_ms(),
                });
            }
            Action::Encounter { .. } => {
                let mut rng = rand::thread_rng();
                responses.encounter = Some(EncounterPayload {
                    move_1: rng.gen_range(1..=300),
                    move_2: rng.gen_range(1..=300),
                    individual_attack: rng.gen_range(0..=15),
                    individual_defense: rng.gen_range(0..=15),
                    individual_stamina: rng.gen_range(0..=15),
                    height_m: rng.gen_range(0.2..2.0),
                    weight_kg: rng.gen_range(1.0..80.0),
                    gender: rng.gen_range(1..=2),
                });
            }
            Action::FortDetails { ref fort_id, .. } => {
                responses.fort_details = Some(FortDetailsData {
                    name: format!("Stop {}", fort_id),
                });
            }
            Action::FortSearch { .. } => {
                responses.fort_search_result = Some(1);
            }
            Action::RecycleItem { .. } => {
                responses.recycle_result = Some(1);
            }
            Action::UseIncubator { .. } => {
                responses.incubator_result = Some(1);
            }
            _ => {}
        }

        if envelope.piggyback.inventory_since_ms.is_some() {
            responses.inventory = Some(InventoryDelta {
                new_timestamp_ms: clock::epoch_ms(),
                entries: Vec::new(),
            });
        }
        if envelope.piggyback.settings_hash.is_some() {
            responses.settings = Some(SettingsData {
                hash: "sim-settings".to_string(),
                minimum_client_version: "0.79.4".to_string(),
            });
        }

        Ok(responses)
    }
}
