//! Throttle Controller
//!
//! Decides whether an optional secondary action (fort spin, consumable
//! use) is currently affordable against the shared request-quota budget.
//! The budget snapshot is refreshed periodically by a background task and
//! read lock-free by every worker; stale reads are acceptable and resolve
//! conservatively to "not affordable".

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock;
use crate::config::defaults::QUOTA_PERIOD_SECS;
use crate::remote::{QuotaSnapshot, RemoteApiFactory};

/// Whether `cost` additional requests are affordable under `snapshot`.
///
/// Linear projection: the budget left after the request must exceed the
/// safety margin plus the expected consumption over the remaining period.
pub fn affordable(snapshot: &QuotaSnapshot, now: f64, cost: u32, spare_fraction: f64) -> bool {
    let seconds_left = snapshot.period_end - now;
    if seconds_left <= 0.0 {
        // Snapshot describes an already-finished period.
        return false;
    }
    let spare = spare_fraction * f64::from(snapshot.maximum);
    let left = f64::from(snapshot.remaining) - f64::from(cost);
    let usable_per_second = (f64::from(snapshot.maximum) - spare) / QUOTA_PERIOD_SECS;
    left > usable_per_second * seconds_left + spare
}

/// Lock-free holder of the latest quota snapshot.
#[derive(Debug, Default)]
pub struct QuotaCell {
    snapshot: ArcSwapOption<QuotaSnapshot>,
}

impl QuotaCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, snapshot: QuotaSnapshot) {
        self.snapshot.store(Some(Arc::new(snapshot)));
    }

    pub fn load(&self) -> Option<Arc<QuotaSnapshot>> {
        self.snapshot.load_full()
    }

    /// Affordability check against the latest snapshot; absent or stale
    /// snapshots are never affordable.
    pub fn affordable(&self, cost: u32, spare_fraction: f64) -> bool {
        match self.load() {
            Some(snapshot) => affordable(&snapshot, clock::epoch(), cost, spare_fraction),
            None => false,
        }
    }
}

/// Background task copying the quota authority's status into the shared
/// cell at a fixed interval.
pub async fn run_quota_watcher(
    cell: Arc<QuotaCell>,
    factory: Arc<dyn RemoteApiFactory>,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(refresh_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[QuotaWatcher] Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                if let Some(snapshot) = factory.quota_status() {
                    debug!(
                        remaining = snapshot.remaining,
                        maximum = snapshot.maximum,
                        "Quota snapshot refreshed"
                    );
                    cell.store(snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(maximum: u32, remaining: u32, period_end: f64) -> QuotaSnapshot {
        QuotaSnapshot {
            maximum,
            remaining,
            period_end,
        }
    }

    #[test]
    fn absent_snapshot_is_not_affordable() {
        let cell = QuotaCell::new();
        assert!(!cell.affordable(1, 0.05));
    }

    #[test]
    fn stale_snapshot_is_not_affordable() {
        // Period ended one second ago; even a full budget is refused.
        let s = snapshot(150, 150, 100.0);
        assert!(!affordable(&s, 101.0, 1, 0.05));
    }

    #[test]
    fn plentiful_budget_is_affordable() {
        // 150 remaining, 30 s left: projected use ~71 + spare 7.5 << 148.
        let s = snapshot(150, 150, 130.0);
        assert!(affordable(&s, 100.0, 2, 0.05));
    }

    #[test]
    fn exhausted_budget_is_not_affordable() {
        let s = snapshot(150, 5, 130.0);
        assert!(!affordable(&s, 100.0, 2, 0.05));
    }

    #[test]
    fn monotone_in_remaining() {
        // Holding everything else fixed, increasing `remaining` never
        // flips an affordable verdict back to unaffordable.
        let mut previous = false;
        for remaining in (0..=150).step_by(5) {
            let s = snapshot(150, remaining, 120.0);
            let verdict = affordable(&s, 100.0, 1, 0.05);
            assert!(
                verdict || !previous,
                "verdict regressed at remaining={}",
                remaining
            );
            previous = verdict;
        }
        assert!(previous, "full budget should be affordable");
    }

    #[test]
    fn cell_stores_latest() {
        let cell = QuotaCell::new();
        cell.store(snapshot(150, 10, 0.0));
        cell.store(snapshot(150, 140, clock::epoch() + 30.0));
        let latest = cell.load().expect("snapshot present");
        assert_eq!(latest.remaining, 140);
        assert!(cell.affordable(1, 0.05));
    }
}
