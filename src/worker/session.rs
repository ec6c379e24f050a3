//! Session state and authentication lifecycle
//!
//! The session is the per-agent mutable state behind every request:
//! position, pacing timestamps, inventory snapshot, and capability flags.
//! Alongside it live the login sequence, the post-login establishment
//! requests, and the tutorial driver for fresh accounts.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

use super::call::{CallError, CallOptions};
use super::Worker;
use crate::config::defaults::{
    APP_VERSION, DEFAULT_ITEM_CAPACITY, INFINITE_INCUBATOR_ITEM, REQUIRED_TUTORIAL_STEPS,
};
use crate::geo::Point;
use crate::remote::{
    Action, AvatarSpec, Credentials, InventoryDelta, InventoryEntry, RemoteError,
};
use crate::types::{Account, StatusCode};

/// An egg awaiting incubation.
#[derive(Debug, Clone)]
pub struct EggState {
    pub id: u64,
    pub km_target: f64,
    pub in_incubator: bool,
}

/// An incubator with no egg assigned.
#[derive(Debug, Clone)]
pub struct IncubatorState {
    pub id: u64,
    pub item_id: u16,
}

/// Per-agent session state, exclusively owned by one worker.
#[derive(Debug)]
pub struct Session {
    pub account: Account,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    /// Epoch second of the last remote request of any kind.
    pub last_request: f64,
    /// Earliest epoch second the next interactive action may run.
    pub last_action: f64,
    /// Epoch second of the last map query.
    pub last_gmo: f64,
    pub inventory_timestamp: u64,
    pub player_level: Option<u8>,
    pub bag_items: u32,
    pub item_capacity: u32,
    pub eggs: HashMap<u64, EggState>,
    /// Unused incubators; infinite ones kept at the back so they are
    /// preferred when assigning.
    pub unused_incubators: VecDeque<IncubatorState>,
    /// CAPTCHA solve attempts charged to this account.
    pub captcha_attempts: u32,
    pub empty_visits: u32,
    pub spins_enabled: bool,
    /// Epoch second before which no spin is attempted.
    pub next_spin: f64,
}

impl Session {
    pub fn new(account: Account, fallback_location: Point, spins_enabled: bool) -> Self {
        let (lat, lon) = account.location.unwrap_or(fallback_location);
        let last_request = account.time;
        let bag_items = account.items.values().sum();
        let inventory_timestamp = if account.items.is_empty() {
            0
        } else {
            account.inventory_timestamp
        };
        let player_level = account.level;
        Self {
            account,
            lat,
            lon,
            altitude: 0.0,
            last_request,
            last_action: last_request,
            last_gmo: last_request,
            inventory_timestamp,
            player_level,
            bag_items,
            item_capacity: DEFAULT_ITEM_CAPACITY,
            eggs: HashMap::new(),
            unused_incubators: VecDeque::new(),
            captcha_attempts: 0,
            empty_visits: 0,
            spins_enabled,
            next_spin: 0.0,
        }
    }

    /// Sync mutable state back into the account record for the pool.
    pub fn write_back(&mut self, auth: Option<(String, f64)>) {
        self.account.location = Some((self.lat, self.lon));
        self.account.time = self.last_request;
        self.account.inventory_timestamp = self.inventory_timestamp;
        if self.player_level.is_some() {
            self.account.level = self.player_level;
        }
        if let Some((token, expiry)) = auth {
            self.account.auth_token = Some(token);
            self.account.token_expiry = Some(expiry);
        }
    }

    /// Apply an inventory delta observed on any response.
    pub fn update_inventory(&mut self, delta: &InventoryDelta, incubate_eggs: bool) {
        let mut incubators_reset = false;
        for entry in &delta.entries {
            match entry {
                InventoryEntry::Item { id, count } => {
                    self.account.items.insert(*id, *count);
                    self.bag_items = self.account.items.values().sum();
                }
                InventoryEntry::Egg {
                    id,
                    km_target,
                    incubator_id,
                } if incubate_eggs => {
                    self.eggs.insert(
                        *id,
                        EggState {
                            id: *id,
                            km_target: *km_target,
                            in_incubator: incubator_id.is_some(),
                        },
                    );
                }
                InventoryEntry::Incubator { id, item_id, in_use } if incubate_eggs => {
                    if !incubators_reset {
                        self.unused_incubators.clear();
                        incubators_reset = true;
                    }
                    if *in_use {
                        continue;
                    }
                    let state = IncubatorState {
                        id: *id,
                        item_id: *item_id,
                    };
                    if *item_id == INFINITE_INCUBATOR_ITEM {
                        self.unused_incubators.push_back(state);
                    } else {
                        self.unused_incubators.push_front(state);
                    }
                }
                InventoryEntry::PlayerStats { level } => {
                    self.player_level = Some(*level);
                }
                _ => {}
            }
        }
    }

    pub fn credentials(&self, timeout: Duration) -> Credentials {
        Credentials {
            username: self.account.username.clone(),
            password: self.account.password.clone(),
            provider: self.account.provider.clone(),
            timeout,
        }
    }
}

// ============================================================================
// Authentication & Establishment
// ============================================================================

impl Worker {
    /// Log the session in and, for a fresh login, run the establishment
    /// sequence.
    ///
    /// Transient auth failures retry with a short pause; an unexpected
    /// auth failure rotates the account immediately. For `reauth`, the
    /// result is reported as a bool instead of an error so the caller can
    /// chain its own rotation policy.
    pub(crate) fn login(
        &mut self,
        reauth: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, CallError>> + Send + '_>>
    {
        Box::pin(async move {
        info!(worker = self.index, username = %self.session.account.username, "Trying to log in");

        let timeout = Duration::from_secs(self.ctx.config.login.login_timeout_secs);
        let mut last_err: Option<RemoteError> = None;
        let mut attempt = 0;
        while attempt <= self.ctx.config.login.max_retries {
            self.set_code(StatusCode::WaitingForLogin);
            let credentials = self.session.credentials(timeout);
            let ctx = std::sync::Arc::clone(&self.ctx);
            let result = {
                let _permit = ctx.login_permits.acquire().await.ok();
                self.set_code(StatusCode::LoggingIn);
                self.api.authenticate(&credentials).await
            };
            match result {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(RemoteError::AuthUnexpected(msg)) => {
                    warn!(error = %msg, "Unexpected auth failure");
                    self.swap_account("unexpected auth error").await;
                    attempt += 1;
                }
                Err(err @ RemoteError::AuthFailed(_)) => {
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other.into()),
            }
        }

        if reauth {
            return Ok(match last_err {
                Some(err) => {
                    self.set_code(StatusCode::NotAuthenticated);
                    info!(username = %self.session.account.username, error = %err, "Re-auth failed");
                    false
                }
                None => {
                    self.set_code(StatusCode::Idle);
                    true
                }
            });
        }
        if let Some(err) = last_err {
            return Err(err.into());
        }

        {
            let ctx = std::sync::Arc::clone(&self.ctx);
            let _permit = ctx.setup_permits.acquire().await.ok();
            self.set_code(StatusCode::Setup);
            if self.ctx.config.login.app_simulation {
                self.establish_session(APP_VERSION).await?;
            } else {
                self.download_remote_config(APP_VERSION).await?;
            }
        }
        self.set_code(StatusCode::Idle);
        Ok(true)
        })
    }

    /// Profile fetch; detects warned/banned accounts and records level,
    /// capacity, and creation time. Returns the tutorial state.
    pub(crate) async fn get_player(&mut self) -> Result<Option<Vec<u8>>, CallError> {
        let responses = self
            .call(
                Action::GetPlayer {
                    locale: self.ctx.config.login.player_locale.clone(),
                },
                CallOptions::bare(),
            )
            .await?;

        let Some(player) = responses.player else {
            return Ok(None);
        };
        if player.warn {
            return Err(CallError::AccountWarned);
        }
        if player.banned {
            return Err(CallError::AccountBanned);
        }
        // The API can report 0 as capacity.
        if player.max_item_storage != 0 {
            self.session.item_capacity = player.max_item_storage;
        }
        if self.session.account.created.is_none() && player.creation_timestamp_ms != 0 {
            self.session.account.created = Some(player.creation_timestamp_ms as f64 / 1000.0);
        }
        Ok(Some(player.tutorial_state))
    }

    /// Remote-config fetch. Returns (asset, template) timestamps for the
    /// staleness comparison against the account's recorded ones.
    pub(crate) async fn download_remote_config(
        &mut self,
        version: u32,
    ) -> Result<(f64, f64), CallError> {
        let responses = self
            .call(
                Action::DownloadRemoteConfig {
                    platform: 1,
                    app_version: version,
                },
                CallOptions {
                    buddy: false,
                    settings: true,
                    inbox: false,
                    dl_hash: false,
                    ..CallOptions::default()
                },
            )
            .await?;

        self.random_sleep(0.78, 1.05).await;
        Ok(responses
            .remote_config
            .map(|config| {
                (
                    config.asset_digest_timestamp_ms as f64 / 1_000_000.0,
                    config.item_templates_timestamp_ms as f64 / 1_000.0,
                )
            })
            .unwrap_or((0.0, 0.0)))
    }

    /// Post-login request simulation: warm-up ping, profile, remote
    /// config, stale asset/template downloads, and either the tutorial or
    /// the profile/rewards/store closing sequence.
    pub(crate) async fn establish_session(&mut self, version: u32) -> Result<(), CallError> {
        info!(worker = self.index, "Starting session establishment sequence");

        self.call(Action::Ping, CallOptions::bare()).await?;
        self.random_sleep(0.43, 0.97).await;

        let tutorial_state = self.get_player().await?;
        self.random_sleep(0.53, 1.1).await;

        let (asset_time, template_time) = self.download_remote_config(version).await?;

        if asset_time > self.session.account.asset_time {
            self.download_paginated(|page_offset, page_timestamp| Action::GetAssetDigest {
                app_version: version,
                page_offset,
                page_timestamp,
            })
            .await?;
            self.session.account.asset_time = asset_time;
        }

        if template_time > self.session.account.template_time {
            self.download_paginated(|page_offset, page_timestamp| Action::DownloadItemTemplates {
                page_offset,
                page_timestamp,
            })
            .await?;
            self.session.account.template_time = template_time;
        }

        let tutorial_incomplete = tutorial_state.as_ref().is_some_and(|state| {
            !REQUIRED_TUTORIAL_STEPS
                .iter()
                .all(|step| state.contains(step))
        });

        if self.ctx.config.login.complete_tutorial && tutorial_incomplete {
            let state = tutorial_state.unwrap_or_default();
            warn!(username = %self.session.account.username, "Account is starting the tutorial");
            self.complete_tutorial(&state).await?;
        } else {
            self.call(
                Action::GetPlayerProfile,
                CallOptions {
                    settings: true,
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
            self.random_sleep(0.2, 0.3).await;

            if let Some(level) = self.session.player_level {
                self.call(
                    Action::LevelUpRewards { level },
                    CallOptions {
                        settings: true,
                        ..CallOptions::default()
                    },
                )
                .await?;
                self.random_sleep(0.45, 0.7).await;
            } else {
                warn!(username = %self.session.account.username, "No player level");
            }

            self.call(Action::GetStoreItems, CallOptions::bare()).await?;
            self.random_sleep(0.43, 0.97).await;

            info!(worker = self.index, "Finished session establishment sequence");
            self.random_sleep(0.5, 1.3).await;
        }
        Ok(())
    }

    /// Drive one paginated download to completion with jittered pacing.
    async fn download_paginated(
        &mut self,
        make_action: impl Fn(i32, u64) -> Action,
    ) -> Result<(), CallError> {
        use rand::Rng;
        let mut burst = rand::thread_rng().gen_range(0..=3);
        let mut result = 2;
        let mut page_offset = 0;
        let mut page_timestamp = 0;
        while result == 2 {
            let responses = self
                .call(
                    make_action(page_offset, page_timestamp),
                    CallOptions {
                        buddy: false,
                        settings: true,
                        inbox: false,
                        ..CallOptions::default()
                    },
                )
                .await?;
            if burst > 2 {
                tokio::time::sleep(Duration::from_secs_f64(1.45)).await;
                burst = 0;
            } else {
                burst += 1;
                tokio::time::sleep(Duration::from_secs_f64(0.2)).await;
            }
            let Some(page) = responses.page else { break };
            result = page.result;
            page_offset = page.page_offset;
            page_timestamp = page.timestamp_ms;
        }
        Ok(())
    }

    /// Fixed ordered tutorial sequence with human-like pacing.
    pub(crate) async fn complete_tutorial(&mut self, state: &[u8]) -> Result<(), CallError> {
        self.set_code(StatusCode::Tutorial);

        if !state.contains(&0) {
            // legal screen
            self.call(
                Action::MarkTutorialComplete { steps: vec![0] },
                CallOptions {
                    buddy: false,
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
            self.random_sleep(0.35, 0.525).await;
            self.get_player().await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if !state.contains(&1) {
            // avatar selection
            self.set_avatar(true).await?;
        }

        let mut starter_id = None;
        if !state.contains(&3) {
            // first capture
            self.random_sleep(0.7, 0.9).await;
            self.call(
                Action::GetDownloadUrls {
                    asset_ids: vec![
                        "1a3c2816-65fa-4b97-90eb-0b301c064b7a/1487275569649000".to_string(),
                        "aa8f7687-a022-4773-b900-3a8c170e9aea/1487275581132582".to_string(),
                        "e89109b0-9a54-40fe-8431-12f7826c8194/1487275593635524".to_string(),
                    ],
                },
                CallOptions {
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;

            self.random_sleep(7.0, 10.3).await;
            let starter = {
                use rand::seq::SliceRandom;
                *[1u16, 4, 7]
                    .choose(&mut rand::thread_rng())
                    .unwrap_or(&1)
            };
            let responses = self
                .call(
                    Action::EncounterTutorialComplete {
                        pokemon_id: starter,
                    },
                    CallOptions {
                        inbox: false,
                        action: Some(1.0),
                        ..CallOptions::default()
                    },
                )
                .await?;
            starter_id = responses.inventory.as_ref().and_then(|delta| {
                delta.entries.iter().find_map(|entry| match entry {
                    InventoryEntry::Creature { id, .. } => Some(*id),
                    _ => None,
                })
            });

            self.random_sleep(0.4, 0.5).await;
            self.call(
                Action::GetPlayer {
                    locale: self.ctx.config.login.player_locale.clone(),
                },
                CallOptions {
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
        }

        if !state.contains(&4) {
            // name claim
            self.random_sleep(12.0, 18.0).await;
            self.call(
                Action::ClaimCodename {
                    codename: self.session.account.username.clone(),
                },
                CallOptions {
                    inbox: false,
                    action: Some(2.0),
                    ..CallOptions::default()
                },
            )
            .await?;

            tokio::time::sleep(Duration::from_secs_f64(0.7)).await;
            self.call(
                Action::GetPlayer {
                    locale: self.ctx.config.login.player_locale.clone(),
                },
                CallOptions {
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
            tokio::time::sleep(Duration::from_secs_f64(0.13)).await;

            self.call(
                Action::MarkTutorialComplete { steps: vec![4] },
                CallOptions {
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
        }

        if !state.contains(&7) {
            // first-time experience
            self.random_sleep(3.9, 4.5).await;
            self.call(
                Action::MarkTutorialComplete { steps: vec![7] },
                CallOptions {
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
        }

        if let Some(starter_id) = starter_id {
            // buddy assignment
            self.random_sleep(4.0, 5.0).await;
            self.call(
                Action::SetBuddy {
                    pokemon_id: starter_id,
                },
                CallOptions {
                    inbox: false,
                    action: Some(2.0),
                    ..CallOptions::default()
                },
            )
            .await?;
            self.random_sleep(0.8, 1.2).await;
        }

        tokio::time::sleep(Duration::from_secs_f64(0.2)).await;
        Ok(())
    }

    async fn set_avatar(&mut self, tutorial: bool) -> Result<(), CallError> {
        let avatar = AvatarSpec::random();
        self.call(
            Action::ListAvatarCustomizations,
            CallOptions {
                buddy: !tutorial,
                inbox: false,
                action: Some(5.0),
                ..CallOptions::default()
            },
        )
        .await?;
        self.random_sleep(7.0, 14.0).await;

        self.call(
            Action::SetAvatar { avatar },
            CallOptions {
                buddy: !tutorial,
                inbox: false,
                action: Some(2.0),
                ..CallOptions::default()
            },
        )
        .await?;

        if tutorial {
            self.random_sleep(0.5, 4.0).await;
            self.call(
                Action::MarkTutorialComplete { steps: vec![1] },
                CallOptions {
                    buddy: false,
                    inbox: false,
                    ..CallOptions::default()
                },
            )
            .await?;
        }
        self.random_sleep(0.5, 1.0).await;

        self.call(
            Action::GetPlayerProfile,
            CallOptions {
                inbox: false,
                action: Some(1.0),
                ..CallOptions::default()
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        let mut account = Account::placeholder();
        account.username = "scout".to_string();
        account.time = 1_000.0;
        account
    }

    #[test]
    fn session_inherits_account_state() {
        let mut a = account();
        a.location = Some((40.0, -74.0));
        a.items.insert(1, 20);
        a.inventory_timestamp = 77;
        let session = Session::new(a, (0.0, 0.0), true);
        assert_eq!((session.lat, session.lon), (40.0, -74.0));
        assert_eq!(session.last_request, 1_000.0);
        assert_eq!(session.bag_items, 20);
        assert_eq!(session.inventory_timestamp, 77);
    }

    #[test]
    fn empty_bag_resets_inventory_timestamp() {
        let mut a = account();
        a.inventory_timestamp = 77;
        let session = Session::new(a, (0.0, 0.0), false);
        assert_eq!(session.inventory_timestamp, 0);
    }

    #[test]
    fn inventory_delta_updates_bag_and_level() {
        let mut session = Session::new(account(), (0.0, 0.0), false);
        let delta = InventoryDelta {
            new_timestamp_ms: 5,
            entries: vec![
                InventoryEntry::Item { id: 1, count: 10 },
                InventoryEntry::Item { id: 2, count: 5 },
                InventoryEntry::PlayerStats { level: 12 },
            ],
        };
        session.update_inventory(&delta, false);
        assert_eq!(session.bag_items, 15);
        assert_eq!(session.player_level, Some(12));
    }

    #[test]
    fn incubator_ordering_prefers_infinite() {
        let mut session = Session::new(account(), (0.0, 0.0), false);
        let delta = InventoryDelta {
            new_timestamp_ms: 5,
            entries: vec![
                InventoryEntry::Incubator {
                    id: 1,
                    item_id: 902,
                    in_use: false,
                },
                InventoryEntry::Incubator {
                    id: 2,
                    item_id: INFINITE_INCUBATOR_ITEM,
                    in_use: false,
                },
                InventoryEntry::Incubator {
                    id: 3,
                    item_id: 902,
                    in_use: true,
                },
            ],
        };
        session.update_inventory(&delta, true);
        assert_eq!(session.unused_incubators.len(), 2);
        // the back of the queue (popped first) is the infinite one
        assert_eq!(session.unused_incubators.back().map(|i| i.id), Some(2));
    }

    #[test]
    fn write_back_syncs_account() {
        let mut session = Session::new(account(), (0.0, 0.0), false);
        session.lat = 1.0;
        session.lon = 2.0;
        session.last_request = 9_999.0;
        session.player_level = Some(30);
        session.write_back(Some(("token".to_string(), 12_345.0)));
        assert_eq!(session.account.location, Some((1.0, 2.0)));
        assert_eq!(session.account.time, 9_999.0);
        assert_eq!(session.account.level, Some(30));
        assert_eq!(session.account.auth_token.as_deref(), Some("token"));
    }
}
