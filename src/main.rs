//! Spyglass - map crawl and observation ingestion engine
//!
//! # Usage
//!
//! ```bash
//! # Run the fleet against the simulated backend
//! cargo run --release -- --accounts accounts.json
//!
//! # With an explicit config file
//! cargo run --release -- --config spyglass.toml --accounts accounts.json
//! ```
//!
//! # Environment Variables
//!
//! - `SPYGLASS_CONFIG`: path to the TOML config (when `--config` is absent)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spyglass::config::Config;
use spyglass::context::SharedContext;
use spyglass::pool::AccountPool;
use spyglass::remote::sim::SimulatedBackend;
use spyglass::remote::RemoteApiFactory;
use spyglass::types::ScanJob;
use spyglass::worker::Worker;
use spyglass::{sink, throttle};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "spyglass")]
#[command(about = "Spyglass map crawl and observation ingestion engine")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the JSON account pool file (loaded at startup, written
    /// back on shutdown)
    #[arg(short, long, default_value = "accounts.json")]
    accounts: PathBuf,

    /// Override the number of workers from the config
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds between fleet status summaries in the log
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Simulated quota maximum per period for the built-in backend
    #[arg(long, default_value = "150")]
    sim_quota: u32,
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = {
        let mut config = Config::load(args.config.as_deref());
        if let Some(workers) = args.workers {
            config.scan.workers = workers;
        }
        config
    };

    let accounts = Arc::new(
        AccountPool::load(&args.accounts)
            .with_context(|| format!("loading account pool from {}", args.accounts.display()))?,
    );

    let worker_count = config.scan.workers;
    let grid = config.scan.bounds.grid(config.scan.grid_step_deg);
    info!(
        workers = worker_count,
        grid_points = grid.len(),
        accounts = accounts.active_len(),
        "Starting crawl fleet"
    );

    let (ctx, evictor, observations) = SharedContext::build(config, Arc::clone(&accounts));
    let factory: Arc<dyn RemoteApiFactory> = Arc::new(SimulatedBackend::new(args.sim_quota));

    // Graceful shutdown via Ctrl+C
    let cancel = CancellationToken::new();
    {
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C, initiating shutdown");
            shutdown.cancel();
        });
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Background: cache eviction
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            evictor.run(cancel).await;
            Ok(())
        });
    }

    // Background: quota snapshot refresh
    {
        let cell = Arc::clone(&ctx.quota);
        let factory = Arc::clone(&factory);
        let interval = Duration::from_secs(ctx.config.throttle.refresh_interval_secs.max(1));
        let cancel = cancel.clone();
        tasks.spawn(async move {
            throttle::run_quota_watcher(cell, factory, interval, cancel).await;
            Ok(())
        });
    }

    // Background: ingestion drain (stands in for the external queue)
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            sink::run_drain(observations, cancel).await;
            Ok(())
        });
    }

    // Background: scan-job feeder cycling the grid
    let (job_tx, job_rx) = mpsc::channel::<ScanJob>(worker_count.max(1) * 2);
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            'feeder: loop {
                for point in &grid {
                    let job = ScanJob::point(*point);
                    tokio::select! {
                        _ = cancel.cancelled() => break 'feeder,
                        sent = job_tx.send(job) => {
                            if sent.is_err() {
                                break 'feeder;
                            }
                        }
                    }
                }
            }
            Ok(())
        });
    }

    // Background: periodic fleet summary
    {
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        let mut interval = tokio::time::interval(Duration::from_secs(args.status_interval.max(5)));
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        info!(
                            seen = ctx.seen_total.load(Ordering::Relaxed),
                            captchas = ctx.captchas_total.load(Ordering::Relaxed),
                            discovered = ctx.spawns.discovered_count(),
                            accounts_active = ctx.accounts.active_len(),
                            accounts_benched = ctx.accounts.bench_len(),
                            "Fleet status"
                        );
                    }
                }
            }
            Ok(())
        });
    }

    // The worker fleet
    let jobs = Arc::new(Mutex::new(job_rx));
    let mut started = 0;
    for index in 0..worker_count {
        let worker = match Worker::new(index, Arc::clone(&ctx), Arc::clone(&factory), cancel.clone())
        {
            Ok(worker) => worker,
            Err(e) => {
                error!(error = %e, "Could not start worker {}", index);
                break;
            }
        };
        started += 1;
        let jobs = Arc::clone(&jobs);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = worker.run(jobs).await {
                error!(error = %e, "Worker hit a fatal condition, stopping fleet");
                cancel.cancel();
                return Err(e.into());
            }
            Ok(())
        });
    }
    if started == 0 {
        error!("No workers could be started, shutting down");
        cancel.cancel();
    }

    // Wait for every task; a fatal worker error has already cancelled
    // the rest.
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failure = Some(e),
            Err(e) => warn!(error = %e, "Task panicked or was aborted"),
        }
    }

    if let Err(e) = accounts.store(&args.accounts) {
        warn!(error = %e, "Could not write account pool back to disk");
    }
    info!(
        seen = ctx.seen_total.load(Ordering::Relaxed),
        captchas = ctx.captchas_total.load(Ordering::Relaxed),
        "Shutdown complete"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
