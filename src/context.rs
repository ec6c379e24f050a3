//! Shared worker context
//!
//! Everything workers share lives in one explicitly constructed context
//! passed at spawn time: configuration, caches, the ingestion sink, the
//! quota cell, pools, the login/setup semaphores, global counters, and
//! the status board. Nothing is reached through ambient global state.

use dashmap::DashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

use crate::altitude::{AltitudeCache, AltitudeProvider, ElevationClient};
use crate::cache::evictor::{self, Evictor};
use crate::cache::ObservationCaches;
use crate::captcha::{ChallengeSolver, VendorSolver};
use crate::config::Config;
use crate::geo::CellCache;
use crate::notify::Notifier;
use crate::pool::{AccountPool, ProxyRing};
use crate::sink::ObservationSink;
use crate::spawns::SpawnRegistry;
use crate::throttle::QuotaCell;
use crate::types::{Observation, WorkerReport};

/// Shared state for the worker fleet.
pub struct SharedContext {
    pub config: Config,
    pub caches: Arc<ObservationCaches>,
    pub sink: ObservationSink,
    pub quota: Arc<QuotaCell>,
    pub accounts: Arc<AccountPool>,
    pub proxies: Option<ProxyRing>,
    /// Bounds concurrent authentication sequences process-wide.
    pub login_permits: Semaphore,
    /// Bounds concurrent post-login setup sequences process-wide.
    pub setup_permits: Semaphore,
    pub seen_total: AtomicU64,
    pub captchas_total: AtomicU64,
    pub status_board: DashMap<usize, WorkerReport>,
    pub cells: CellCache,
    pub altitudes: AltitudeCache,
    pub altitude_provider: Option<Box<dyn AltitudeProvider>>,
    pub solver: Option<Arc<dyn ChallengeSolver>>,
    pub notifier: Option<Arc<Notifier>>,
    pub spawns: SpawnRegistry,
    /// Settings digest shared across sessions, updated from responses.
    pub download_hash: Mutex<Option<String>>,
}

impl SharedContext {
    /// Build the context plus the two endpoints main owns: the eviction
    /// task to spawn, and the ingestion receiver to drain.
    pub fn build(
        config: Config,
        accounts: Arc<AccountPool>,
    ) -> (Arc<Self>, Evictor, mpsc::UnboundedReceiver<Observation>) {
        let (sink, observations) = ObservationSink::new();
        let (evictor_handle, evictor_rx) = evictor::channel();
        let caches = Arc::new(ObservationCaches::new(evictor_handle));
        let evictor = Evictor::new(Arc::clone(&caches), sink.clone(), evictor_rx);

        let altitude_provider: Option<Box<dyn AltitudeProvider>> = config
            .altitude
            .url
            .as_deref()
            .map(|url| Box::new(ElevationClient::new(url)) as Box<dyn AltitudeProvider>);
        let solver: Option<Arc<dyn ChallengeSolver>> =
            VendorSolver::from_config(&config.captcha).map(|s| Arc::new(s) as Arc<dyn ChallengeSolver>);

        let context = Arc::new(Self {
            caches,
            sink,
            quota: Arc::new(QuotaCell::new()),
            accounts,
            proxies: ProxyRing::new(config.proxy.proxies.clone()),
            login_permits: Semaphore::new(config.login.simultaneous_logins.max(1)),
            setup_permits: Semaphore::new(config.login.simultaneous_setup.max(1)),
            seen_total: AtomicU64::new(0),
            captchas_total: AtomicU64::new(0),
            status_board: DashMap::new(),
            cells: CellCache::new(config.scan.cache_cells),
            altitudes: AltitudeCache::new(&config.altitude),
            altitude_provider,
            solver,
            notifier: Notifier::from_config(&config.notify),
            spawns: SpawnRegistry::new(),
            download_hash: Mutex::new(None),
            config,
        });

        (context, evictor, observations)
    }

    /// Whether CAPTCHA challenges can currently be solved.
    pub fn solving_available(&self) -> bool {
        self.solver.as_ref().is_some_and(|s| s.enabled())
    }

    /// Current shared settings digest.
    pub fn settings_hash(&self) -> Option<String> {
        self.download_hash.lock().expect("hash lock").clone()
    }

    pub fn set_settings_hash(&self, hash: String) {
        *self.download_hash.lock().expect("hash lock") = Some(hash);
    }
}
