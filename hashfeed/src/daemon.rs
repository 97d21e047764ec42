//! Daemon lifecycle management for hashfeed.
//!
//! This module handles the core daemon functionality including loading the
//! configuration and saved state, task management, signal handling, and
//! graceful shutdown.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::SchedulerConfig;
use crate::lifecycle::Startable;
use crate::persist::{BuiltinSources, InstanceState};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::types::HashRate;
use crate::work_source::dummy::{DummyParams, DummySource};
use crate::work_source::{SourceSettings, WorkSourceNode, DEFAULT_GROUP_NAME};
use crate::worker::config::CpuMinerConfig;
use crate::worker::cpu::CpuDevice;
use crate::worker::Worker;

/// Path of the saved instance state.
pub const STATE_VAR: &str = "HASHFEED_STATE";
pub const DEFAULT_STATE_PATH: &str = "config/default.json";

/// Number of dummy sources in the fallback tree.
pub const DUMMY_SOURCES_VAR: &str = "HASHFEED_DUMMY_SOURCES";

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = SchedulerConfig::from_env().context("Loading scheduler configuration")?;
        let shutdown_timeout = config.queue.shutdown_timeout();
        let min_ahead = config.queue.lookahead();
        let scheduler = Arc::new(Scheduler::new(config)?);

        let state_path = env::var(STATE_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_PATH));
        let saved = InstanceState::load(&state_path)
            .with_context(|| format!("Loading saved state from {}", state_path.display()))?;
        match saved {
            Some(state) => {
                scheduler.inflate(&state, &BuiltinSources).await?;
                info!(path = %state_path.display(), "Restored saved state");
            }
            None => {
                info!(
                    path = %state_path.display(),
                    "No saved state, using dummy work sources"
                );
                scheduler.set_root(Some(dummy_tree(&scheduler))).await?;
            }
        }

        scheduler.start().await?;

        // CPU devices, one per thread
        if let Some(cpu) = CpuMinerConfig::from_env() {
            info!(
                threads = cpu.thread_count,
                duty = cpu.duty_percent,
                "CPU miner enabled"
            );
            for index in 0..cpu.thread_count {
                let device = CpuDevice::new(format!("cpu-{}", index), cpu.duty_percent);
                let worker = Worker::new(device.clone(), scheduler.speed_signal().clone());
                scheduler.add_worker(worker.clone());
                self.tracker.spawn(device.run(
                    worker,
                    scheduler.queue().clone(),
                    min_ahead,
                    self.shutdown.clone(),
                ));
            }
        } else {
            info!("No devices configured (set HASHFEED_CPUMINER_THREADS to hash on the CPU)");
        }

        self.tracker.spawn({
            let scheduler = scheduler.clone();
            let shutdown = self.shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(STATUS_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => log_status(&scheduler),
                    }
                }
            }
        });

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set HASHFEED_LOG=hashfeed=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();
        scheduler.stop().await;

        if tokio::time::timeout(shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(timeout = ?shutdown_timeout, "Some tasks did not stop in time");
        }

        match scheduler.deflate().save(&state_path) {
            Ok(()) => info!(path = %state_path.display(), "Saved state"),
            Err(e) => error!(path = %state_path.display(), error = %e, "Could not save state"),
        }
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

/// The tree used when nothing was saved: a group of dummy sources, each on
/// its own private blockchain.
fn dummy_tree(scheduler: &Scheduler) -> Arc<WorkSourceNode> {
    let count = env::var(DUMMY_SOURCES_VAR)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(1)
        .max(1);

    let config = scheduler.config().clone();
    let root = WorkSourceNode::group(SourceSettings::named(DEFAULT_GROUP_NAME), config.clone());
    for seed in 0..count {
        let params = DummyParams {
            seed,
            ..Default::default()
        };
        let leaf = WorkSourceNode::leaf(
            SourceSettings::named(format!("dummy-{}", seed)),
            Arc::new(DummySource::new(params)),
            None,
            config.clone(),
        );
        // A fresh group cannot form a cycle.
        if let Err(e) = root.attach(leaf) {
            warn!(error = %e, "Could not add dummy work source");
        }
    }
    root
}

fn log_status(scheduler: &Scheduler) {
    let stats = scheduler.get_statistics();
    let hashrate = HashRate(
        scheduler
            .workers()
            .iter()
            .map(|w| w.rates().hashrate.0)
            .sum(),
    );
    let (accepted, rejected, ghashes) = stats
        .root
        .as_ref()
        .map(|r| (r.shares_accepted, r.shares_rejected, r.ghashes))
        .unwrap_or_default();

    info!(
        hashrate = %hashrate.to_human_readable(),
        workers = stats.workers.len(),
        queued = stats.queue.depth,
        target = stats.queue.target,
        fetching = stats.queue.in_flight,
        ghashes = format!("{:.3}", ghashes),
        accepted,
        rejected,
        "Status"
    );
}
