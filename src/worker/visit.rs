//! Point-visit protocol
//!
//! `visit` wraps one map-query cycle with altitude resolution, lazy
//! login, and the full failure dispatch: every classified error resolves
//! to retry-in-place, reauthenticate-and-retry, rotate-account,
//! rotate-proxy, bench-for-CAPTCHA, or abandon-and-report. Only
//! process-fatal conditions and cooperative cancellation escape, and
//! cancellation is re-raised only after flushing observations already
//! normalized but not yet emitted.

use std::time::Duration;
use tracing::{error, info, warn};

use super::call::CallError;
use super::Worker;
use crate::clock;
use crate::config::defaults::{BOOTSTRAP_ATTEMPTS, MAX_EMPTY_VISITS};
use crate::geo::Point;
use crate::normalize;
use crate::remote::{Action, FortKind, RemoteError};
use crate::types::{Observation, ScanJob, StatusCode};
use crate::worker::CallOptions;

/// The only failures that escape the visit loop.
#[derive(Debug, thiserror::Error)]
pub enum VisitError {
    /// Halts the whole fleet (forced version upgrade, expired API key).
    #[error("fatal: {0}")]
    Fatal(String),
    /// Cooperative cancellation, re-raised after flushing.
    #[error("visit cancelled")]
    Cancelled,
}

/// What the error dispatch decided about the current visit.
enum Recovery {
    /// Retry the same point with current (possibly rotated) state.
    Retry,
    /// Abandon the visit and report failure upstream.
    Abandon,
}

impl Worker {
    /// Visit one map point, with recovery. `Ok(Some(n))` is a completed
    /// visit that saw `n` entities; `Ok(None)` an abandoned one.
    pub async fn visit(&mut self, job: &ScanJob) -> Result<Option<usize>, VisitError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(VisitError::Cancelled);
            }

            self.speed = self.travel_speed(job.point);
            let altitude = self
                .ctx
                .altitudes
                .resolve(job.point, self.ctx.altitude_provider.as_deref())
                .await;
            self.session.lat = job.point.0;
            self.session.lon = job.point.1;
            self.session.altitude = altitude;
            self.api
                .set_position(self.session.lat, self.session.lon, altitude);

            if !self.api.authenticated() {
                if let Err(err) = self.login(false).await {
                    match self.dispatch_failure(err).await? {
                        Recovery::Retry => continue,
                        Recovery::Abandon => return Ok(None),
                    }
                }
            }

            match self.visit_point(job).await {
                Ok(count) => return Ok(Some(count)),
                Err(err) => match self.dispatch_failure(err).await? {
                    Recovery::Retry => continue,
                    Recovery::Abandon => return Ok(None),
                },
            }
        }
    }

    /// Bootstrap visits retry in place a few times with slight jitter.
    pub async fn bootstrap_visit(&mut self, point: Point) -> Result<bool, VisitError> {
        let job = ScanJob::bootstrap(point);
        for _ in 0..BOOTSTRAP_ATTEMPTS {
            if self.visit(&job).await?.is_some() {
                return Ok(true);
            }
            self.set_code(StatusCode::Bootstrapping);
            self.simulate_jitter(0.00005);
        }
        Ok(false)
    }

    /// Exhaustive classification of a visit failure into its recovery
    /// policy. Every branch logs and updates the status code; nothing is
    /// swallowed silently.
    async fn dispatch_failure(&mut self, err: CallError) -> Result<Recovery, VisitError> {
        match err {
            CallError::Remote(remote) => match remote {
                RemoteError::NotLoggedIn => {
                    self.set_code(StatusCode::NotAuthenticated);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    match self.login(true).await {
                        Ok(true) => {}
                        Ok(false) => self.swap_account("reauth failed").await,
                        Err(e) => {
                            warn!(error = %e, "Reauthentication errored, giving up on visit");
                            return Ok(Recovery::Abandon);
                        }
                    }
                    Ok(Recovery::Retry)
                }
                RemoteError::AuthFailed(msg) => {
                    warn!(username = %self.session.account.username, error = %msg, "Login failed");
                    self.set_code(StatusCode::NotAuthenticated);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    self.swap_account("login failed").await;
                    Ok(Recovery::Abandon)
                }
                RemoteError::AuthUnexpected(msg) => {
                    warn!(error = %msg, "Unexpected auth failure");
                    self.swap_account("unexpected auth error").await;
                    Ok(Recovery::Abandon)
                }
                RemoteError::QuotaServiceBan => {
                    self.set_code(StatusCode::QuotaServiceBan);
                    error!("Temporarily banned from the quota service");
                    tokio::time::sleep(Duration::from_secs(185)).await;
                    Ok(Recovery::Abandon)
                }
                RemoteError::QuotaExceeded { .. } => {
                    self.set_code(StatusCode::QuotaExceeded);
                    warn!("Quota still exhausted after retries, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::QuotaServiceOffline(msg) | RemoteError::QuotaServiceError(msg) => {
                    self.set_code(StatusCode::QuotaServiceError);
                    warn!(error = %msg, "Quota service trouble, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::Timeout => {
                    warn!("Request timed out repeatedly, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::EndpointOffline(msg) => {
                    warn!(error = %msg, "Endpoint failure, rotating account");
                    self.swap_account("endpoint failure").await;
                    Ok(Recovery::Abandon)
                }
                RemoteError::EndpointBusy(msg) => {
                    warn!(error = %msg, "Endpoint busy, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::Proxy(msg) => {
                    self.set_code(StatusCode::ProxyError);
                    if self.ctx.proxies.as_ref().is_some_and(|p| p.multi()) {
                        error!(error = %msg, "Proxy failure, swapping proxy");
                        self.swap_proxy();
                    } else {
                        error!(error = %msg, "Proxy failure");
                    }
                    Ok(Recovery::Abandon)
                }
                RemoteError::IpBanned => {
                    self.set_code(StatusCode::IpBanned);
                    if self.ctx.proxies.as_ref().is_some_and(|p| p.multi()) {
                        warn!("Egress address banned, swapping proxy");
                        self.swap_proxy();
                    } else {
                        error!("Egress address banned");
                    }
                    Ok(Recovery::Abandon)
                }
                RemoteError::BadRequest => {
                    self.set_code(StatusCode::BadRequest);
                    warn!(
                        username = %self.session.account.username,
                        "Repeated bad-request code, likely banned; removing until next run"
                    );
                    self.discard_account().await;
                    Ok(Recovery::Abandon)
                }
                RemoteError::InvalidRequest(msg) => {
                    self.set_code(StatusCode::InvalidRequest);
                    warn!(error = %msg, "Invalid request, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::Malformed(msg) | RemoteError::Unexpected(msg) => {
                    self.set_code(StatusCode::MalformedResponse);
                    warn!(error = %msg, "Unusable response, giving up on visit");
                    Ok(Recovery::Abandon)
                }
                RemoteError::ApiKeyExpired(msg) => {
                    self.set_code(StatusCode::KeyExpired);
                    error!(error = %msg, "API key expired");
                    Err(VisitError::Fatal(format!("API key expired: {msg}")))
                }
            },
            CallError::CaptchaRequired => {
                self.set_code(StatusCode::Captcha);
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.bench_account().await;
                Ok(Recovery::Abandon)
            }
            CallError::CaptchaSolveFailed => {
                self.set_code(StatusCode::Captcha);
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.swap_account("solving CAPTCHA failed").await;
                Ok(Recovery::Abandon)
            }
            CallError::AccountWarned => {
                self.set_code(StatusCode::Warn);
                warn!(username = %self.session.account.username, "Account is warned");
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.remove_account(true).await;
                Ok(Recovery::Abandon)
            }
            CallError::AccountBanned => {
                self.set_code(StatusCode::Banned);
                warn!(username = %self.session.account.username, "Account is banned");
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.remove_account(false).await;
                Ok(Recovery::Abandon)
            }
            CallError::VersionForced(version) => {
                Err(VisitError::Fatal(format!("forced client version {version}")))
            }
            CallError::Cancelled => {
                warn!(worker = self.index, "Visit cancelled");
                Err(VisitError::Cancelled)
            }
        }
    }

    /// One map-query cycle: query, iterate cells, gate through the
    /// caches, run the optional sub-protocols, emit, and update health
    /// bookkeeping.
    pub(crate) async fn visit_point(&mut self, job: &ScanJob) -> Result<usize, CallError> {
        self.set_code(if job.bootstrap {
            StatusCode::Bootstrapping
        } else {
            StatusCode::Visiting
        });
        info!(
            worker = self.index,
            lat = %format!("{:.4}", job.point.0),
            lon = %format!("{:.4}", job.point.1),
            "Visiting point"
        );

        let cell_ids = self.ctx.cells.cover(job.point);

        // Enforce the per-agent spacing between map queries.
        let scan_delay = self.ctx.config.scan.effective_scan_delay();
        let wait = self.session.last_gmo + scan_delay - clock::epoch();
        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        let responses = self
            .call(
                Action::GetMapObjects {
                    cell_ids: cell_ids.as_ref().clone(),
                    latitude: job.point.0,
                    longitude: job.point.1,
                },
                CallOptions::default(),
            )
            .await?;
        self.session.last_gmo = self.session.last_request;

        let Some(map) = responses.map_objects else {
            self.random_sleep(0.5, 1.0).await;
            self.get_player().await?;
            return Err(RemoteError::Unexpected("missing map-objects response".to_string()).into());
        };
        if map.status != 1 {
            self.session.empty_visits += 1;
            if self.session.empty_visits > MAX_EMPTY_VISITS {
                let reason = format!("{} empty visits", self.session.empty_visits);
                self.swap_account(&reason).await;
            }
            return Err(RemoteError::Unexpected(format!(
                "map query rejected with status {}",
                map.status
            ))
            .into());
        }

        let mut pokemon_seen: usize = 0;
        let mut forts_seen: usize = 0;
        let mut points_seen: usize = 0;
        let mut seen_target = job.spawn_id.is_none();

        if !self.ctx.config.inventory.item_limits.is_empty()
            && self.session.bag_items >= self.session.item_capacity
        {
            self.clean_bag().await?;
        }

        let numeric_ids = self.ctx.config.scan.numeric_spawn_ids;
        let encounter_conf = self.ctx.config.encounter.clone();

        for cell in &map.cells {
            if self.cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }

            for wild in &cell.wild_creatures {
                pokemon_seen += 1;
                let mut sighting = normalize::creature(wild, &self.ctx.spawns, numeric_ids);
                if let Some(expected) = &job.spawn_id {
                    seen_target = seen_target || sighting.spawn_id == *expected;
                }

                let fresh = !self.ctx.caches.sightings.contains(&sighting)
                    && !self.ctx.caches.mysteries.contains(&sighting);

                if fresh && encounter_conf.selects(sighting.pokemon_id) {
                    self.encounter_flushing(&mut sighting, &wild.spawn_point_id)
                        .await?;
                }

                if let Some(notifier) = self.ctx.notifier.clone() {
                    if notifier.eligible(&sighting) {
                        if encounter_conf.enabled() && sighting.encounter.is_none() {
                            self.encounter_flushing(&mut sighting, &wild.spawn_point_id)
                                .await?;
                        }
                        notifier.notify_sighting(sighting.clone(), map.time_of_day);
                    }
                }

                if fresh {
                    self.emit_sighting(sighting);
                }
            }

            for fort in &cell.forts {
                if !fort.enabled {
                    continue;
                }
                forts_seen += 1;

                match fort.kind {
                    FortKind::Pokestop => {
                        if let Some(lured) =
                            normalize::lured(fort, cell.current_timestamp_ms, numeric_ids)
                        {
                            pokemon_seen += 1;
                            if !self.ctx.caches.sightings.contains(&lured) {
                                self.emit_sighting(lured);
                            }
                        }

                        let now = clock::epoch();
                        if self.session.spins_enabled
                            && self.session.bag_items < self.session.item_capacity
                            && now > self.session.next_spin
                            && self.throttle_allows(2)
                        {
                            let cooldown = fort.cooldown_complete_timestamp_ms;
                            if cooldown == 0 || now > cooldown as f64 / 1000.0 {
                                self.spin_pokestop(fort).await?;
                            }
                        }

                        if !self.ctx.caches.forts.pokestop_known(&fort.id) {
                            self.ctx.caches.forts.add_pokestop(&fort.id);
                            self.ctx
                                .sink
                                .emit(Observation::Pokestop(normalize::pokestop(fort)));
                        }
                    }
                    FortKind::Gym => {
                        if !self.ctx.caches.forts.gym_known(&fort.id) {
                            self.ctx.caches.forts.add_gym(&fort.id);
                            self.ctx.sink.emit(Observation::Fort(normalize::gym(fort)));
                        }
                        if fort.raid.is_some() && !self.ctx.caches.raids.contains(fort) {
                            if let Some(raid) = normalize::raid(fort) {
                                if let Some(notifier) = &self.ctx.notifier {
                                    if notifier.raids_enabled() {
                                        notifier.notify_raid(raid.clone());
                                    }
                                }
                                self.ctx.caches.raids.add(&raid);
                                self.ctx.sink.emit(Observation::Raid(raid));
                            }
                        }
                    }
                }
            }

            if self.ctx.config.scan.more_points {
                for candidate in &cell.spawn_points {
                    points_seen += 1;
                    let point = (candidate.latitude, candidate.longitude);
                    if self.ctx.spawns.have_point(point)
                        || !self.ctx.config.scan.bounds.contains(point)
                    {
                        continue;
                    }
                    self.ctx.spawns.discover(point);
                }
            }

            if let Some(weather) = &cell.weather {
                let record = normalize::weather(weather);
                if !self.ctx.caches.weather.contains(&record) {
                    self.ctx.caches.weather.add(&record);
                    self.ctx.sink.emit(Observation::Weather(record));
                }
            }
        }

        if let Some(spawn_id) = &job.spawn_id {
            self.ctx.sink.emit(Observation::Target {
                spawn_id: spawn_id.clone(),
                seen: seen_target,
            });
        }

        if self.ctx.config.inventory.incubate_eggs
            && !self.session.unused_incubators.is_empty()
            && self.session.eggs.values().any(|egg| !egg.in_incubator)
            && self.throttle_allows(1)
        {
            self.incubate_eggs().await?;
        }

        if pokemon_seen > 0 {
            self.set_code_deferred_reset(StatusCode::Seen);
            self.bump_seen(pokemon_seen as u64);
            self.session.empty_visits = 0;
        } else {
            self.session.empty_visits += 1;
            if forts_seen == 0 {
                warn!(
                    username = %self.session.account.username,
                    speed = %format!("{:.2}", self.speed),
                    "Nothing seen at point"
                );
                self.set_code_deferred_reset(StatusCode::NothingSeen);
            } else {
                self.set_code_deferred_reset(StatusCode::EmptyVisit);
            }
            if self.session.empty_visits > MAX_EMPTY_VISITS && !job.bootstrap {
                let reason = format!("{} empty visits", self.session.empty_visits);
                self.swap_account(&reason).await;
            }
        }
        self.visits += 1;
        self.publish_report(pokemon_seen as u64);
        self.write_back();

        info!(
            worker = self.index,
            pokemon_seen, forts_seen, "Point processed"
        );
        Ok(pokemon_seen + forts_seen + points_seen)
    }

    /// Detailed capture with flush-on-cancel: if cancellation lands
    /// mid-capture, the already-normalized record is emitted before the
    /// cancellation propagates. Other capture failures are logged and the
    /// record continues without enrichment.
    async fn encounter_flushing(
        &mut self,
        sighting: &mut crate::types::Sighting,
        spawn_point_id: &str,
    ) -> Result<(), CallError> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            result = self.encounter(sighting, spawn_point_id) => result,
        };
        match result {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => {
                self.emit_sighting(sighting.clone());
                Err(CallError::Cancelled)
            }
            Err(err) => {
                warn!(error = %err, "Detailed capture failed, emitting without enrichment");
                Ok(())
            }
        }
    }

    /// Insert into the right cache and forward downstream.
    fn emit_sighting(&self, sighting: crate::types::Sighting) {
        if sighting.expiry.is_some() {
            self.ctx.caches.sightings.add(&sighting);
            self.ctx.sink.emit(Observation::Pokemon(sighting));
        } else {
            self.ctx.caches.mysteries.add(&sighting);
            self.ctx.sink.emit(Observation::Mystery(sighting));
        }
    }
}
