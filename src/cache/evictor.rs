//! Cache eviction task
//!
//! A single delay-queue owned by the runtime replaces ad-hoc "call me in
//! N seconds" timers: cache insertions enqueue an eviction request and
//! return immediately, and this task fires them in deadline order without
//! ever blocking the scheduler. Mystery evictions may produce a summary
//! update, which is forwarded to the ingestion sink.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::debug;

use super::{MysteryKey, ObservationCaches};
use crate::clock;
use crate::sink::ObservationSink;
use crate::types::SpawnId;

/// One scheduled cache removal.
#[derive(Debug, Clone)]
pub enum Eviction {
    Sighting(SpawnId),
    Mystery(MysteryKey),
    Raid(String),
}

#[derive(Debug)]
pub struct EvictionRequest {
    /// Epoch second at or after which the eviction fires.
    pub fire_at: u64,
    pub eviction: Eviction,
}

/// Cheap handle caches use to schedule evictions.
#[derive(Debug, Clone)]
pub struct EvictorHandle {
    tx: mpsc::UnboundedSender<EvictionRequest>,
}

impl EvictorHandle {
    pub fn schedule(&self, fire_at: u64, eviction: Eviction) {
        // A closed evictor only happens during shutdown; entries die with
        // the process anyway.
        let _ = self.tx.send(EvictionRequest { fire_at, eviction });
    }
}

/// Create the handle/receiver pair wiring caches to the evictor task.
pub fn channel() -> (EvictorHandle, mpsc::UnboundedReceiver<EvictionRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EvictorHandle { tx }, rx)
}

/// The eviction task. Runs until cancellation; never blocks.
pub struct Evictor {
    caches: Arc<ObservationCaches>,
    sink: ObservationSink,
    rx: mpsc::UnboundedReceiver<EvictionRequest>,
}

impl Evictor {
    pub fn new(
        caches: Arc<ObservationCaches>,
        sink: ObservationSink,
        rx: mpsc::UnboundedReceiver<EvictionRequest>,
    ) -> Self {
        Self { caches, sink, rx }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut queue: DelayQueue<(Eviction, u64)> = DelayQueue::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[Evictor] Shutdown signal received");
                    break;
                }
                request = self.rx.recv() => {
                    match request {
                        Some(EvictionRequest { fire_at, eviction }) => {
                            let delay = (fire_at as f64 - clock::epoch()).max(0.0);
                            queue.insert((eviction, fire_at), Duration::from_secs_f64(delay));
                        }
                        None => break,
                    }
                }
                Some(expired) = queue.next() => {
                    let (eviction, fire_at) = expired.into_inner();
                    self.apply(eviction, fire_at);
                }
            }
        }
    }

    /// Apply one due eviction. The scheduled fire time is the reference
    /// for the due-guards, so a stale timer from an earlier insertion
    /// can never evict a fresher entry.
    fn apply(&self, eviction: Eviction, fire_at: u64) {
        match eviction {
            Eviction::Sighting(spawn_id) => {
                self.caches.sightings.evict_due(&spawn_id, fire_at);
            }
            Eviction::Mystery(key) => {
                if let Some(update) = self.caches.mysteries.evict_due(&key, fire_at) {
                    self.sink.emit(update);
                }
            }
            Eviction::Raid(fort_id) => {
                self.caches.raids.evict_due(&fort_id, fire_at);
            }
        }
    }
}
