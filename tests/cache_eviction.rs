//! Cache Eviction Tests
//!
//! Runs the eviction task under paused time and asserts the timing
//! contract: entries survive until their expiry, evictions fire at or
//! after it, and a mystery entry observed more than once produces
//! exactly one summary update.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use spyglass::cache::evictor::{self, Evictor};
use spyglass::cache::ObservationCaches;
use spyglass::clock;
use spyglass::sink::ObservationSink;
use spyglass::types::{Expiry, Inference, Observation, Sighting, SpawnId};

fn timed_sighting(spawn: u64, seen: u64, expire: u64) -> Sighting {
    Sighting {
        encounter_id: spawn * 10,
        pokemon_id: 25,
        spawn_id: SpawnId::Id(spawn),
        lat: 0.0,
        lon: 0.0,
        seen,
        expiry: Some(Expiry {
            expire_timestamp: expire,
            time_till_hidden: (expire - seen) as f64,
            inference: Inference::Measured,
        }),
        display: None,
        encounter: None,
    }
}

fn mystery_sighting(spawn: u64, seen: u64) -> Sighting {
    Sighting {
        encounter_id: spawn * 10,
        pokemon_id: 25,
        spawn_id: SpawnId::Id(spawn),
        lat: 0.0,
        lon: 0.0,
        seen,
        expiry: None,
        display: None,
        encounter: None,
    }
}

struct Harness {
    caches: Arc<ObservationCaches>,
    observations: tokio::sync::mpsc::UnboundedReceiver<Observation>,
    cancel: CancellationToken,
}

fn start_evictor() -> Harness {
    let (sink, observations) = ObservationSink::new();
    let (handle, evictor_rx) = evictor::channel();
    let caches = Arc::new(ObservationCaches::new(handle));
    let cancel = CancellationToken::new();
    tokio::spawn(Evictor::new(Arc::clone(&caches), sink, evictor_rx).run(cancel.clone()));
    Harness {
        caches,
        observations,
        cancel,
    }
}

#[tokio::test(start_paused = true)]
async fn sighting_evicts_at_expiry_not_before() {
    let mut harness = start_evictor();
    let now = clock::epoch_secs();
    let sighting = timed_sighting(1, now, now + 30);

    harness.caches.sightings.add(&sighting);
    assert!(harness.caches.sightings.contains(&sighting));
    // let the evictor register the timer before time advances
    tokio::task::yield_now().await;

    // well before expiry: still cached
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.caches.sightings.contains(&sighting));

    // past expiry: gone, and eviction emitted nothing downstream
    tokio::time::sleep(Duration::from_secs(25)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.caches.sightings.contains(&sighting));
    assert!(harness.observations.try_recv().is_err());

    harness.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn mystery_seen_twice_emits_exactly_one_summary() {
    let mut harness = start_evictor();
    let now = clock::epoch_secs();

    let first = mystery_sighting(7, now);
    harness.caches.mysteries.add(&first);
    tokio::task::yield_now().await;
    // the same identity observed again later refreshes the last-seen time
    assert!(harness
        .caches
        .mysteries
        .contains(&mystery_sighting(7, now + 120)));

    // past the retention window the summary fires
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let update = harness.observations.try_recv().expect("summary emitted");
    match update {
        Observation::MysteryUpdate { first, last, .. } => {
            assert_eq!(first, now);
            assert_eq!(last, now + 120);
        }
        other => panic!("expected mystery update, got {:?}", other),
    }
    assert!(
        harness.observations.try_recv().is_err(),
        "exactly one summary per insertion"
    );

    harness.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn mystery_seen_once_emits_nothing() {
    let mut harness = start_evictor();
    let now = clock::epoch_secs();

    harness.caches.mysteries.add(&mystery_sighting(9, now));
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.observations.try_recv().is_err());
    harness.cancel.cancel();
}
