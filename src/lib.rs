//! Spyglass: map crawl and observation ingestion engine
//!
//! Fleet of automated worker sessions crawling a grid of geographic
//! points against a remote location-based game's API, extracting
//! wildlife / point-of-interest / raid observations and forwarding them,
//! deduplicated, to an external ingestion queue.
//!
//! ## Architecture
//!
//! - **Worker**: per-agent crawl loop, failure recovery, account rotation
//! - **Session**: authentication lifecycle and request-envelope state
//! - **Caches**: shared time-bounded dedup sets gating downstream emission
//! - **Throttle**: shared request-quota budget gating secondary actions
//! - **Normalization**: raw entities to canonical observation records

pub mod altitude;
pub mod cache;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod context;
pub mod geo;
pub mod normalize;
pub mod notify;
pub mod pool;
pub mod remote;
pub mod sink;
pub mod spawns;
pub mod throttle;
pub mod types;
pub mod worker;

// Re-export the types most callers need
pub use config::Config;
pub use context::SharedContext;
pub use sink::ObservationSink;
pub use types::{Account, Observation, ScanJob, SpawnId, StatusCode, WorkerReport};
pub use worker::{JobQueue, Worker};
