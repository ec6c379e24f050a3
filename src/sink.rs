//! Ingestion queue producer
//!
//! Fire-and-forget handle onto the external ingestion queue. The producer
//! never waits for durable persistence; delivery is at-least-once and the
//! downstream consumer owns deduplicated storage.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::Observation;

/// Cloneable producer handle for normalized observation records.
#[derive(Debug, Clone)]
pub struct ObservationSink {
    tx: mpsc::UnboundedSender<Observation>,
}

impl ObservationSink {
    /// Create a sink and the receiver end the ingestion consumer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Observation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one record. A closed queue is logged, never propagated; the
    /// crawl loop does not stall on ingestion.
    pub fn emit(&self, observation: Observation) {
        if self.tx.send(observation).is_err() {
            warn!("Ingestion queue closed, observation dropped");
        }
    }
}

/// Minimal ingestion consumer used when no external queue is attached:
/// counts records and logs at debug level.
pub async fn run_drain(
    mut rx: mpsc::UnboundedReceiver<Observation>,
    cancel: CancellationToken,
) -> u64 {
    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            observation = rx.recv() => {
                match observation {
                    Some(obs) => {
                        received += 1;
                        debug!(?obs, "Observation ingested");
                    }
                    None => break,
                }
            }
        }
    }
    info!(received, "Ingestion drain stopped");
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Observation, SpawnId};

    #[test]
    fn emit_is_fire_and_forget() {
        let (sink, mut rx) = ObservationSink::new();
        sink.emit(Observation::Target {
            spawn_id: SpawnId::Id(1),
            seen: true,
        });
        let received = rx.try_recv().expect("record queued");
        assert!(matches!(received, Observation::Target { seen: true, .. }));

        // Dropping the receiver must not make emit fail or panic.
        drop(rx);
        sink.emit(Observation::Target {
            spawn_id: SpawnId::Id(2),
            seen: false,
        });
    }
}
