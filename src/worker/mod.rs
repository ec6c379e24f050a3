//! Worker: one crawl agent
//!
//! A worker owns exactly one account session and one remote-client handle
//! at a time, executes the point-visit protocol, classifies failures into
//! recovery actions, and rotates to a different account or proxy when the
//! current one becomes unusable. Many workers run concurrently against
//! the shared context; nothing in here is reachable from two workers at
//! once except the explicitly shared caches, pools, and counters.

mod call;
mod interact;
mod session;
mod visit;

pub use call::{CallError, CallOptions};
pub use session::{EggState, IncubatorState, Session};
pub use visit::VisitError;

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock;
use crate::context::SharedContext;
use crate::geo::{self, Point};
use crate::pool::PoolError;
use crate::remote::{RemoteApi, RemoteApiFactory};
use crate::types::{Account, ScanJob, StatusCode, WorkerReport};

/// Shared handle to the scan-job queue workers pull from.
pub type JobQueue = Arc<Mutex<mpsc::Receiver<ScanJob>>>;

pub struct Worker {
    pub(crate) index: usize,
    pub(crate) ctx: Arc<SharedContext>,
    pub(crate) factory: Arc<dyn RemoteApiFactory>,
    pub(crate) api: Box<dyn RemoteApi>,
    pub(crate) session: Session,
    pub(crate) cancel: CancellationToken,
    /// Travel speed since the previous request, per hour.
    pub(crate) speed: f64,
    pub(crate) total_seen: u64,
    pub(crate) visits: u64,
    pub(crate) code: StatusCode,
    /// Deferred status reset after a successful visit.
    pub(crate) code_reset_at: Option<f64>,
}

impl Worker {
    /// Construct a worker, pulling its first account from the pool.
    pub fn new(
        index: usize,
        ctx: Arc<SharedContext>,
        factory: Arc<dyn RemoteApiFactory>,
        cancel: CancellationToken,
    ) -> Result<Self, PoolError> {
        let account = ctx.accounts.try_take()?;
        let fallback = ctx.config.scan.bounds.center();
        let session = Session::new(account, fallback, ctx.config.spin.enabled);
        let api = Self::build_api(&ctx, factory.as_ref(), &session);

        Ok(Self {
            index,
            ctx,
            factory,
            api,
            session,
            cancel,
            speed: 0.0,
            total_seen: 0,
            visits: 0,
            code: StatusCode::Init,
            code_reset_at: None,
        })
    }

    fn build_api(
        ctx: &SharedContext,
        factory: &dyn RemoteApiFactory,
        session: &Session,
    ) -> Box<dyn RemoteApi> {
        let mut api = factory.create();
        if let Some(proxies) = &ctx.proxies {
            api.set_proxy(Some(proxies.next()));
        }
        if let (Some(token), Some(expiry)) = (
            session.account.auth_token.as_deref(),
            session.account.token_expiry,
        ) {
            if api.restore_auth(token, expiry) {
                info!(username = %session.account.username, "Restored cached auth token");
            }
        }
        api.set_position(session.lat, session.lon, session.altitude);
        api
    }

    /// Pull scan jobs until the queue closes or cancellation.
    ///
    /// Only process-fatal failures escape; everything else is recovered
    /// inside the visit protocol.
    pub async fn run(mut self, jobs: JobQueue) -> Result<(), VisitError> {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(job) = job else { break };

            match self.visit(&job).await {
                Ok(_) => {}
                Err(VisitError::Cancelled) => break,
                Err(fatal @ VisitError::Fatal(_)) => {
                    self.write_back();
                    return Err(fatal);
                }
            }
        }
        self.write_back();
        info!(worker = self.index, visits = self.visits, "Worker stopped");
        Ok(())
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub(crate) fn set_code(&mut self, code: StatusCode) {
        self.code = code;
        self.code_reset_at = None;
        self.publish_report(0);
    }

    /// Set a success code that decays back to idle after a minute.
    pub(crate) fn set_code_deferred_reset(&mut self, code: StatusCode) {
        self.code = code;
        self.code_reset_at =
            Some(clock::epoch() + crate::config::defaults::STATUS_RESET_SECS);
        self.publish_report(0);
    }

    /// Current code, applying any due deferred reset.
    pub(crate) fn current_code(&mut self) -> StatusCode {
        if let Some(at) = self.code_reset_at {
            if clock::epoch() >= at {
                self.code = StatusCode::Idle;
                self.code_reset_at = None;
            }
        }
        self.code
    }

    pub(crate) fn publish_report(&mut self, last_seen: u64) {
        let code = self.current_code();
        self.ctx.status_board.insert(
            self.index,
            WorkerReport {
                position: (self.session.lat, self.session.lon),
                updated: Utc::now(),
                speed: self.speed,
                total_seen: self.total_seen,
                visits: self.visits,
                last_seen,
                code,
            },
        );
    }

    // ========================================================================
    // Speed
    // ========================================================================

    /// Travel speed to `point` given the time since the last request,
    /// floored at the scan delay, expressed per hour in the configured
    /// unit.
    pub(crate) fn travel_speed(&self, point: Point) -> f64 {
        self.travel_speed_at(point, clock::epoch())
    }

    pub fn travel_speed_at(&self, point: Point, now: f64) -> f64 {
        let scan_delay = self.ctx.config.scan.effective_scan_delay();
        let distance = geo::distance(
            (self.session.lat, self.session.lon),
            point,
            self.ctx.config.scan.speed_unit,
        );
        geo::travel_speed(distance, now - self.session.last_request, scan_delay)
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Sync session state into the account and roster.
    pub(crate) fn write_back(&mut self) {
        let token = self.api.auth_token();
        self.session.write_back(token);
        self.ctx.accounts.update_roster(&self.session.account);
    }

    /// Swap the current account back into the pool and take a fresh one.
    pub(crate) async fn swap_account(&mut self, reason: &str) {
        self.set_code(StatusCode::Swapping);
        warn!(
            worker = self.index,
            username = %self.session.account.username,
            reason,
            "Swapping out account"
        );
        self.write_back();
        let account = std::mem::replace(&mut self.session.account, Account::placeholder());
        self.ctx.accounts.put(account);
        self.next_account().await;
    }

    /// Park the current account on the CAPTCHA bench and take a fresh one.
    pub(crate) async fn bench_account(&mut self) {
        self.set_code(StatusCode::Benching);
        warn!(
            worker = self.index,
            username = %self.session.account.username,
            "Benching account due to CAPTCHA"
        );
        self.session.account.captcha_flagged = true;
        self.write_back();
        let account = std::mem::replace(&mut self.session.account, Account::placeholder());
        self.ctx.accounts.park(account);
        self.next_account().await;
    }

    /// Permanently remove the current account from rotation.
    pub(crate) async fn remove_account(&mut self, warned: bool) {
        self.set_code(StatusCode::Removing);
        if warned {
            self.session.account.warned = true;
            warn!(username = %self.session.account.username, "Removing account due to warn");
        } else {
            self.session.account.banned = true;
            warn!(username = %self.session.account.username, "Removing account due to ban");
        }
        self.write_back();
        let account = std::mem::replace(&mut self.session.account, Account::placeholder());
        self.ctx.accounts.retire(account);
        self.next_account().await;
    }

    /// Drop the current account without requeueing (suspected ban) and
    /// take a fresh one.
    pub(crate) async fn discard_account(&mut self) {
        self.set_code(StatusCode::Removing);
        self.write_back();
        let account = std::mem::replace(&mut self.session.account, Account::placeholder());
        self.ctx.accounts.retire(account);
        self.next_account().await;
    }

    /// Pull the next account from the pool and rebuild session state.
    async fn next_account(&mut self) {
        let prefer_benched = self.ctx.solving_available()
            && (self.ctx.config.captcha.favor_benched || self.ctx.accounts.active_len() == 0);
        let account = self.ctx.accounts.take(prefer_benched).await;
        info!(worker = self.index, username = %account.username, "Took over account");

        let fallback = self.ctx.config.scan.bounds.center();
        self.session = Session::new(account, fallback, self.ctx.config.spin.enabled);
        self.api = Self::build_api(&self.ctx, self.factory.as_ref(), &self.session);
        self.set_code(StatusCode::Idle);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) fn bump_seen(&mut self, count: u64) {
        self.total_seen += count;
        self.ctx.seen_total.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) async fn random_sleep(&self, min_secs: f64, max_secs: f64) {
        let secs = {
            use rand::Rng;
            rand::thread_rng().gen_range(min_secs..=max_secs)
        };
        tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
    }

    /// Whether the throttle currently affords `cost` extra requests.
    pub(crate) fn throttle_allows(&self, cost: u32) -> bool {
        let throttle = &self.ctx.config.throttle;
        !throttle.enabled() || self.ctx.quota.affordable(cost, throttle.spare_fraction)
    }

    /// Randomize position by up to `amount` degrees and ±1 altitude.
    pub(crate) fn simulate_jitter(&mut self, amount: f64) {
        use rand::Rng;
        let jittered = geo::randomize_point((self.session.lat, self.session.lon), amount);
        self.session.lat = jittered.0;
        self.session.lon = jittered.1;
        self.session.altitude = rand::thread_rng()
            .gen_range(self.session.altitude - 1.0..=self.session.altitude + 1.0);
        self.api
            .set_position(self.session.lat, self.session.lon, self.session.altitude);
    }
}
