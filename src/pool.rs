//! Account & proxy pools
//!
//! The engine does not create credentials; it is handed a pool and gives
//! accounts back on rotation or shutdown. Two queues are kept: the active
//! queue feeding rotations, and a bench for CAPTCHA-flagged accounts that
//! can be burned down when a solver is available. A roster tracks the
//! last written-back state of every account for persistence.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::types::Account;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account file error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not enough accounts for the requested number of workers")]
    Exhausted,
}

/// Shared pool of crawl accounts.
#[derive(Debug, Default)]
pub struct AccountPool {
    active: Mutex<VecDeque<Account>>,
    bench: Mutex<VecDeque<Account>>,
    /// Username -> last written-back state, the persistence authority.
    roster: DashMap<String, Account>,
    notify: Notify,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let pool = Self::default();
        {
            let mut active = pool.active.lock().expect("pool lock");
            let mut bench = pool.bench.lock().expect("pool lock");
            for account in accounts {
                pool.roster.insert(account.username.clone(), account.clone());
                if !account.usable() {
                    continue;
                }
                if account.captcha_flagged {
                    bench.push_back(account);
                } else {
                    active.push_back(account);
                }
            }
        }
        pool
    }

    /// Load a pool from a JSON account file.
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let raw = std::fs::read_to_string(path)?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), count = accounts.len(), "Loaded account pool");
        Ok(Self::new(accounts))
    }

    /// Write the roster back to disk.
    pub fn store(&self, path: &Path) -> Result<(), PoolError> {
        let accounts = self.snapshot();
        let json = serde_json::to_string_pretty(&accounts)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), count = accounts.len(), "Stored account pool");
        Ok(())
    }

    /// Last known state of every account ever seen by the pool.
    pub fn snapshot(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> =
            self.roster.iter().map(|entry| entry.value().clone()).collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        accounts
    }

    /// Non-blocking take for worker construction: active queue first,
    /// then the bench.
    pub fn try_take(&self) -> Result<Account, PoolError> {
        if let Some(account) = self.active.lock().expect("pool lock").pop_front() {
            return Ok(account);
        }
        self.bench
            .lock()
            .expect("pool lock")
            .pop_front()
            .ok_or(PoolError::Exhausted)
    }

    /// Take an account for rotation, waiting until one is available.
    ///
    /// With `prefer_benched`, the CAPTCHA bench is drained first (only
    /// sensible when a solver can clear the flag).
    pub async fn take(&self, prefer_benched: bool) -> Account {
        loop {
            // Arm the waiter before checking, so a put racing with the
            // check cannot be missed.
            let notified = self.notify.notified();
            if prefer_benched {
                if let Some(account) = self.bench.lock().expect("pool lock").pop_front() {
                    return account;
                }
            }
            if let Some(account) = self.active.lock().expect("pool lock").pop_front() {
                return account;
            }
            notified.await;
        }
    }

    /// Return an account to the active queue.
    pub fn put(&self, account: Account) {
        self.update_roster(&account);
        self.active.lock().expect("pool lock").push_back(account);
        self.notify.notify_waiters();
    }

    /// Park a CAPTCHA-flagged account on the bench.
    pub fn park(&self, account: Account) {
        self.update_roster(&account);
        self.bench.lock().expect("pool lock").push_back(account);
        self.notify.notify_waiters();
    }

    /// Record an account's final state without requeueing it (warned,
    /// banned, or suspected-banned accounts).
    pub fn retire(&self, account: Account) {
        if account.banned || account.warned {
            warn!(username = %account.username, "Account retired from rotation");
        }
        self.update_roster(&account);
    }

    /// Refresh the roster copy of an account's mutable state.
    pub fn update_roster(&self, account: &Account) {
        self.roster.insert(account.username.clone(), account.clone());
    }

    pub fn active_len(&self) -> usize {
        self.active.lock().expect("pool lock").len()
    }

    pub fn bench_len(&self) -> usize {
        self.bench.lock().expect("pool lock").len()
    }
}

// ============================================================================
// Proxies
// ============================================================================

/// Round-robin egress proxy rotation.
#[derive(Debug)]
pub struct ProxyRing {
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyRing {
    /// `None` when no proxies are configured.
    pub fn new(proxies: Vec<String>) -> Option<Self> {
        if proxies.is_empty() {
            return None;
        }
        Some(Self {
            proxies,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Whether out-of-turn swapping can produce a different proxy.
    pub fn multi(&self) -> bool {
        self.proxies.len() > 1
    }

    pub fn next(&self) -> String {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.proxies[i % self.proxies.len()].clone()
    }

    /// Next proxy differing from `current`, for out-of-turn swaps.
    pub fn swap_from(&self, current: Option<&str>) -> String {
        let mut proxy = self.next();
        if self.multi() {
            while Some(proxy.as_str()) == current {
                proxy = self.next();
            }
        }
        proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn account(name: &str) -> Account {
        Account {
            username: name.to_string(),
            password: "pw".to_string(),
            provider: "ptc".to_string(),
            location: None,
            time: 0.0,
            inventory_timestamp: 0,
            level: None,
            items: HashMap::new(),
            asset_time: 0.0,
            template_time: 0.0,
            created: None,
            auth_token: None,
            token_expiry: None,
            warned: false,
            banned: false,
            captcha_flagged: false,
        }
    }

    #[test]
    fn flagged_accounts_land_on_bench() {
        let mut flagged = account("flagged");
        flagged.captcha_flagged = true;
        let mut banned = account("banned");
        banned.banned = true;

        let pool = AccountPool::new(vec![account("a"), flagged, banned]);
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.bench_len(), 1);
        // banned accounts stay only in the roster
        assert_eq!(pool.snapshot().len(), 3);
    }

    #[test]
    fn take_prefers_bench_when_asked() {
        let mut flagged = account("benched");
        flagged.captcha_flagged = true;
        let pool = AccountPool::new(vec![account("fresh"), flagged]);

        let taken = tokio_test::block_on(pool.take(true));
        assert_eq!(taken.username, "benched");
        let taken = tokio_test::block_on(pool.take(true));
        assert_eq!(taken.username, "fresh");
    }

    #[test]
    fn roster_survives_retirement() {
        let pool = AccountPool::new(vec![account("doomed")]);
        let mut taken = pool.try_take().expect("account available");
        taken.banned = true;
        pool.retire(taken);
        assert_eq!(pool.active_len(), 0);
        let snapshot = pool.snapshot();
        assert!(snapshot[0].banned);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("accounts.json");
        let pool = AccountPool::new(vec![account("a"), account("b")]);
        pool.store(&path).expect("store");

        let reloaded = AccountPool::load(&path).expect("load");
        assert_eq!(reloaded.active_len(), 2);
    }

    #[test]
    fn proxy_ring_rotation() {
        assert!(ProxyRing::new(vec![]).is_none());
        let ring = ProxyRing::new(vec!["p1".to_string(), "p2".to_string()]).expect("ring");
        assert!(ring.multi());
        let first = ring.next();
        let swapped = ring.swap_from(Some(&first));
        assert_ne!(first, swapped);
    }
}
