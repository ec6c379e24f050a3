//! Visit Protocol Tests
//!
//! Drives a worker through full visits against a scripted remote client
//! and asserts on the emitted observation stream: dedup gating, quota
//! retry idempotence, and empty-visit account rotation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use spyglass::clock;
use spyglass::config::{Config, EncounterPolicy};
use spyglass::context::SharedContext;
use spyglass::pool::AccountPool;
use spyglass::remote::{
    Action, Credentials, FortData, FortKind, MapCell, MapObjects, QuotaSnapshot, RemoteApi,
    RemoteApiFactory, RemoteError, RequestEnvelope, ResponseSet, WildCreature,
};
use spyglass::types::{Account, Observation, ScanJob, SpawnId};
use spyglass::worker::Worker;

// ============================================================================
// Scripted remote client
// ============================================================================

/// Outcome of one scripted map query.
enum MapStep {
    Ok(MapObjects),
    Fail(RemoteError),
}

/// Factory whose map queries replay a script; everything else succeeds
/// with empty payloads.
struct ScriptedFactory {
    map_steps: Mutex<VecDeque<MapStep>>,
    created: AtomicUsize,
    auth_attempts: AtomicUsize,
}

impl ScriptedFactory {
    fn new(steps: Vec<MapStep>) -> Arc<Self> {
        Arc::new(Self {
            map_steps: Mutex::new(steps.into_iter().collect()),
            created: AtomicUsize::new(0),
            auth_attempts: AtomicUsize::new(0),
        })
    }
}

impl RemoteApiFactory for Arc<ScriptedFactory> {
    fn create(&self) -> Box<dyn RemoteApi> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedApi {
            shared: Arc::clone(self),
            authenticated: false,
            proxy: None,
        })
    }

    fn quota_status(&self) -> Option<QuotaSnapshot> {
        None
    }
}

struct ScriptedApi {
    shared: Arc<ScriptedFactory>,
    authenticated: bool,
    proxy: Option<String>,
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    fn set_position(&mut self, _lat: f64, _lon: f64, _altitude: f64) {}

    fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    fn proxy(&self) -> Option<String> {
        self.proxy.clone()
    }

    fn restore_auth(&mut self, _token: &str, _expiry: f64) -> bool {
        false
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn auth_token(&self) -> Option<(String, f64)> {
        None
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> Result<(), RemoteError> {
        self.shared.auth_attempts.fetch_add(1, Ordering::SeqCst);
        self.authenticated = true;
        Ok(())
    }

    async fn send(&mut self, envelope: RequestEnvelope) -> Result<ResponseSet, RemoteError> {
        if !self.authenticated {
            return Err(RemoteError::NotLoggedIn);
        }
        let mut responses = ResponseSet::default();
        if let Action::GetMapObjects { .. } = envelope.action {
            let step = self.shared.map_steps.lock().expect("script lock").pop_front();
            match step {
                Some(MapStep::Ok(map)) => responses.map_objects = Some(map),
                Some(MapStep::Fail(err)) => return Err(err),
                // script exhausted: empty but successful map
                None => responses.map_objects = Some(empty_map()),
            }
        }
        Ok(responses)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn wild(spawn: &str, encounter_id: u64) -> WildCreature {
    WildCreature {
        encounter_id,
        spawn_point_id: spawn.to_string(),
        pokemon_id: 19,
        latitude: 40.0005,
        longitude: -74.0005,
        last_modified_timestamp_ms: clock::epoch_ms(),
        time_till_hidden_ms: 60_000,
        display_form: None,
    }
}

fn pokestop(id: &str, enabled: bool) -> FortData {
    FortData {
        id: id.to_string(),
        kind: FortKind::Pokestop,
        latitude: 40.0002,
        longitude: -74.0002,
        enabled,
        last_modified_timestamp_ms: clock::epoch_ms(),
        cooldown_complete_timestamp_ms: 0,
        owned_by_team: 0,
        gym_points: 0,
        guard_pokemon_id: 0,
        slots_available: 0,
        lure: None,
        raid: None,
    }
}

fn map_with(creatures: Vec<WildCreature>, forts: Vec<FortData>) -> MapObjects {
    MapObjects {
        status: 1,
        cells: vec![MapCell {
            current_timestamp_ms: clock::epoch_ms(),
            wild_creatures: creatures,
            forts,
            spawn_points: Vec::new(),
            weather: None,
        }],
        time_of_day: 1,
    }
}

fn empty_map() -> MapObjects {
    map_with(Vec::new(), Vec::new())
}

fn account(name: &str) -> Account {
    let mut account = Account::placeholder();
    account.username = name.to_string();
    account.password = "pw".to_string();
    account
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.scan.workers = 1;
    config.scan.more_points = false;
    // minimal session establishment keeps the scripts focused on visits
    config.login.app_simulation = false;
    config.encounter.policy = EncounterPolicy::None;
    config.spin.enabled = false;
    config.notify.enabled = false;
    config
}

fn build_worker(
    config: Config,
    accounts: Vec<Account>,
    factory: &Arc<ScriptedFactory>,
) -> (
    Worker,
    tokio::sync::mpsc::UnboundedReceiver<Observation>,
    Arc<SharedContext>,
) {
    let pool = Arc::new(AccountPool::new(accounts));
    let (ctx, _evictor, observations) = SharedContext::build(config, pool);
    let worker = Worker::new(
        0,
        Arc::clone(&ctx),
        Arc::new(Arc::clone(factory)),
        CancellationToken::new(),
    )
    .expect("worker construction");
    (worker, observations, ctx)
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Observation>) -> Vec<Observation> {
    let mut out = Vec::new();
    while let Ok(obs) = rx.try_recv() {
        out.push(obs);
    }
    out
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn visit_emits_creatures_and_enabled_forts_once() {
    let factory = ScriptedFactory::new(vec![MapStep::Ok(map_with(
        vec![wild("aa01", 1), wild("aa02", 2)],
        vec![pokestop("disabled-stop", false), pokestop("open-stop", true)],
    ))]);
    let (mut worker, mut observations, _ctx) =
        build_worker(test_config(), vec![account("scout1")], &factory);

    let job = ScanJob::point((40.0, -74.0));
    let seen = worker.visit(&job).await.expect("visit completes");
    assert!(seen.is_some());

    let emitted = drain(&mut observations);
    let creatures = emitted
        .iter()
        .filter(|o| matches!(o, Observation::Pokemon(_)))
        .count();
    let pokestops = emitted
        .iter()
        .filter(|o| matches!(o, Observation::Pokestop(_)))
        .count();
    assert_eq!(creatures, 2, "both wild creatures are forwarded");
    assert_eq!(pokestops, 1, "the disabled fort yields nothing");
    assert_eq!(emitted.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn revisit_is_deduplicated_by_the_caches() {
    let map = map_with(
        vec![wild("aa01", 1)],
        vec![pokestop("open-stop", true)],
    );
    let factory = ScriptedFactory::new(vec![MapStep::Ok(map.clone()), MapStep::Ok(map)]);
    let (mut worker, mut observations, _ctx) =
        build_worker(test_config(), vec![account("scout1")], &factory);

    let job = ScanJob::point((40.0, -74.0));
    worker.visit(&job).await.expect("first visit");
    let first = drain(&mut observations);
    assert_eq!(first.len(), 2);

    worker.visit(&job).await.expect("second visit");
    let second = drain(&mut observations);
    assert!(
        second.is_empty(),
        "identical identities within the window are suppressed: {:?}",
        second
    );
}

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_retry_emits_one_observation_set() {
    let factory = ScriptedFactory::new(vec![
        MapStep::Fail(RemoteError::QuotaExceeded {
            refresh_at: Some(clock::epoch() + 2.0),
        }),
        MapStep::Ok(map_with(vec![wild("bb01", 9)], Vec::new())),
    ]);
    let (mut worker, mut observations, _ctx) =
        build_worker(test_config(), vec![account("scout1")], &factory);

    let job = ScanJob::point((40.0, -74.0));
    let seen = worker.visit(&job).await.expect("visit completes");
    assert!(seen.is_some(), "retry after the period refresh succeeds");

    let emitted = drain(&mut observations);
    let creatures = emitted
        .iter()
        .filter(|o| matches!(o, Observation::Pokemon(_)))
        .count();
    assert_eq!(creatures, 1, "exactly one emission set, not two");
}

#[tokio::test(start_paused = true)]
async fn four_empty_visits_rotate_the_account_exactly_once() {
    let factory = ScriptedFactory::new(
        (0..5).map(|_| MapStep::Ok(empty_map())).collect(),
    );
    let (mut worker, _observations, ctx) = build_worker(
        test_config(),
        vec![account("scout1"), account("scout2")],
        &factory,
    );

    let job = ScanJob::point((40.0, -74.0));
    for _ in 0..4 {
        worker.visit(&job).await.expect("visit completes");
    }
    // rotation on the fourth consecutive empty visit
    assert_eq!(
        factory.created.load(Ordering::SeqCst),
        2,
        "exactly one rotation (one extra client handle)"
    );
    assert_eq!(ctx.accounts.active_len(), 1, "old account went back to the pool");

    // a fifth empty visit with the fresh account must not double-trigger
    worker.visit(&job).await.expect("visit completes");
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn target_record_reports_coverage() {
    let factory = ScriptedFactory::new(vec![
        MapStep::Ok(map_with(vec![wild("cc01", 5)], Vec::new())),
        MapStep::Ok(map_with(vec![wild("cc01", 5)], Vec::new())),
    ]);
    let (mut worker, mut observations, _ctx) =
        build_worker(test_config(), vec![account("scout1")], &factory);

    // expected spawn is observed
    let hit = ScanJob::targeted((40.0, -74.0), SpawnId::Id(0xcc01));
    worker.visit(&hit).await.expect("visit completes");
    let emitted = drain(&mut observations);
    assert!(emitted
        .iter()
        .any(|o| matches!(o, Observation::Target { seen: true, .. })));

    // expected spawn is missing
    let miss = ScanJob::targeted((40.0, -74.0), SpawnId::Id(0xdead));
    worker.visit(&miss).await.expect("visit completes");
    let emitted = drain(&mut observations);
    assert!(emitted
        .iter()
        .any(|o| matches!(o, Observation::Target { seen: false, .. })));
}

#[tokio::test(start_paused = true)]
async fn map_rejection_is_an_abandoned_visit_not_a_crash() {
    let rejected = MapObjects {
        status: 3,
        cells: Vec::new(),
        time_of_day: 0,
    };
    let factory = ScriptedFactory::new(vec![MapStep::Ok(rejected)]);
    let (mut worker, mut observations, _ctx) =
        build_worker(test_config(), vec![account("scout1")], &factory);

    let job = ScanJob::point((40.0, -74.0));
    let outcome = worker.visit(&job).await.expect("no fatal error");
    assert!(outcome.is_none(), "rejected map query abandons the visit");
    assert!(drain(&mut observations).is_empty());
}
