//! Scheduler-side handles for hashing devices.
//!
//! A device driver owns its hardware loop; the scheduler only sees it
//! through the [`Device`] trait (for cancel notifications) and tracks it
//! with a [`Worker`] handle that carries its reported speed and counters.
//! Speed changes wake the fetcher so the queue target follows the
//! aggregate hashrate.

pub mod config;
pub mod cpu;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;

use crate::fetcher::SpeedSignal;
use crate::job::Job;
use crate::registry::{EntityId, Handle};
use crate::statistics::{Counters, EntityKind, Statistics, StatisticsSource};
use crate::tracing::prelude::*;
use crate::types::HashRate;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Cancel failed: {0}")]
    CancelFailed(String),
}

/// Callbacks the scheduler makes into a device driver.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// `job` was canceled. On a graceful cancel the device may finish its
    /// current batch; it must stop working on the job either way and
    /// destroy it once done. Must not block.
    fn notify_canceled(&self, job: &Arc<Job>, graceful: bool) -> Result<(), WorkerError>;
}

/// Reported capacity of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub hashrate: HashRate,
    /// Jobs the device holds at once.
    pub parallel_jobs: usize,
}

impl Rates {
    pub fn jobs_per_second(&self) -> f64 {
        self.hashrate.jobs_per_second()
    }
}

pub struct Worker {
    handle: Handle,
    device: Arc<dyn Device>,
    speed: Arc<SpeedSignal>,
    rates: Mutex<Rates>,
    counters: Mutex<Counters>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name())
            .field("rates", &self.rates())
            .finish()
    }
}

impl Worker {
    pub fn new(device: Arc<dyn Device>, speed: Arc<SpeedSignal>) -> Arc<Self> {
        let mut counters = Counters::default();
        counters.restart();
        Arc::new(Self {
            handle: Handle::default(),
            device,
            speed,
            rates: Mutex::new(Rates::default()),
            counters: Mutex::new(counters),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn id(&self) -> Option<EntityId> {
        self.handle.get()
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn rates(&self) -> Rates {
        *self.rates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report a new speed. The fetcher is told only when something changed.
    pub fn set_rates(&self, hashrate: HashRate, parallel_jobs: usize) {
        let new = Rates {
            hashrate,
            parallel_jobs,
        };
        let changed = {
            let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *rates, new) != new
        };
        if changed {
            trace!(
                worker = %self.name(),
                hashrate = %hashrate.to_human_readable(),
                parallel_jobs,
                "Speed changed"
            );
            self.speed.raise();
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_hashes(&self, hashes: u64) {
        self.counters().hashes += hashes;
    }

    pub(crate) fn record_job_accepted(&self) {
        self.counters().jobs_accepted += 1;
    }

    pub(crate) fn record_job_canceled(&self) {
        self.counters().jobs_canceled += 1;
    }

    pub(crate) fn record_share(&self, accepted: bool) {
        let mut counters = self.counters();
        if accepted {
            counters.shares_accepted += 1;
        } else {
            counters.shares_rejected += 1;
        }
    }

    pub(crate) fn record_invalid(&self) {
        self.counters().shares_invalid += 1;
    }

    pub(crate) fn record_below_target(&self) {
        self.counters().shares_below_target += 1;
    }

    pub(crate) fn notify_canceled(&self, job: &Arc<Job>, graceful: bool) -> Result<(), WorkerError> {
        self.device.notify_canceled(job, graceful)
    }
}

impl StatisticsSource for Worker {
    type Snapshot = Statistics;

    fn get_statistics(&self) -> Statistics {
        let mut stats = Statistics::new(EntityKind::Worker, self.name());
        stats.id = self.id();
        stats.mhps = self.rates().hashrate.as_megahashes();
        self.counters().fill(&mut stats);
        stats
    }
}

/// The set of workers whose speed sizes the queue.
#[derive(Default)]
pub struct WorkerSet {
    workers: RwLock<Vec<Arc<Worker>>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, worker: Arc<Worker>) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if !workers.iter().any(|w| Arc::ptr_eq(w, &worker)) {
            info!(worker = %worker.name(), "Worker added");
            workers.push(worker);
        }
    }

    pub fn remove(&self, worker: &Arc<Worker>) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let before = workers.len();
        workers.retain(|w| !Arc::ptr_eq(w, worker));
        before != workers.len()
    }

    pub fn list(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sum of reported rates across all workers.
    pub fn totals(&self) -> (usize, f64) {
        self.list().iter().fold((0, 0.0), |(parallel, jps), worker| {
            let rates = worker.rates();
            (parallel + rates.parallel_jobs, jps + rates.jobs_per_second())
        })
    }
}
