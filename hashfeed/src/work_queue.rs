//! Expiry-ordered queue between the fetcher and the workers.
//!
//! Jobs are bucketed by the integer second (from the queue's origin) in
//! which they expire. Unclaimed jobs sit in `pending`; claimed ones move to
//! `taken` so that sweeps and flushes can still find and cancel them.
//!
//! The queue keeps a depth counter of pending jobs expiring beyond the
//! near-term cutoff (`now + lookahead`, advanced by the sweep). The fetcher
//! uses it to decide how many more fetches to start.
//!
//! Cancellations requested by producers (a new block, a flushed source) are
//! handed to a dedicated task so that a slow device callback never holds up
//! the producer that noticed the change.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::blockchain::BlockCheck;
use crate::config::SchedulerConfig;
use crate::job::Job;
use crate::lifecycle::Startable;
use crate::tracing::prelude::*;
use crate::types::job_mhashes;
use crate::work_source::WorkSourceNode;
use crate::worker::Worker;

/// Jobs to cancel together, in the cancel task.
struct CancelBatch {
    jobs: Vec<Arc<Job>>,
    graceful: bool,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<u64, VecDeque<Arc<Job>>>,
    taken: BTreeMap<u64, Vec<Arc<Job>>>,
    /// Bucket of `now + lookahead` as of the last sweep.
    cutoff: u64,
    /// Pending jobs in buckets past `cutoff`.
    depth: usize,
    cancel_tx: Option<mpsc::UnboundedSender<CancelBatch>>,
    shutdown: Option<CancellationToken>,
}

impl QueueState {
    fn insert(&mut self, bucket: u64, job: Arc<Job>) {
        if bucket > self.cutoff {
            self.depth += 1;
        }
        self.pending.entry(bucket).or_default().push_back(job);
    }

    fn take_pending(&mut self, bucket: u64, index: usize) -> Option<Arc<Job>> {
        let jobs = self.pending.get_mut(&bucket)?;
        let job = jobs.remove(index)?;
        if jobs.is_empty() {
            self.pending.remove(&bucket);
        }
        if bucket > self.cutoff {
            self.depth -= 1;
        }
        Some(job)
    }

    /// Remove every pending job matching `pred`.
    fn drain_pending(&mut self, mut pred: impl FnMut(&Arc<Job>) -> bool) -> Vec<Arc<Job>> {
        let mut drained = Vec::new();
        let cutoff = self.cutoff;
        let mut removed_beyond = 0;
        self.pending.retain(|bucket, jobs| {
            jobs.retain(|job| {
                if pred(job) {
                    if *bucket > cutoff {
                        removed_beyond += 1;
                    }
                    drained.push(job.clone());
                    false
                } else {
                    true
                }
            });
            !jobs.is_empty()
        });
        self.depth -= removed_beyond;
        drained
    }

    fn drain_taken(&mut self, mut pred: impl FnMut(&Arc<Job>) -> bool) -> Vec<Arc<Job>> {
        let mut drained = Vec::new();
        self.taken.retain(|_, jobs| {
            jobs.retain(|job| {
                if pred(job) {
                    drained.push(job.clone());
                    false
                } else {
                    true
                }
            });
            !jobs.is_empty()
        });
        drained
    }
}

pub struct WorkQueue {
    me: Weak<WorkQueue>,
    config: Arc<SchedulerConfig>,
    origin: Instant,
    state: Mutex<QueueState>,
    /// Serializes blockchain checks with registration, so a job checked
    /// against an old block cannot register after that block was flushed.
    admission: Mutex<()>,
    running: AtomicBool,
    /// Set by stop(), cleared by start(). Waiters before the first start
    /// keep waiting.
    stopped: AtomicBool,
    /// Workers wait here for jobs.
    available: Notify,
    /// The fetcher waits here for the queue to run low.
    demand: Notify,
    tracker: TaskTracker,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("depth", &self.depth())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkQueue {
    pub fn new(config: Arc<SchedulerConfig>) -> Arc<Self> {
        let origin = Instant::now();
        let cutoff = config.queue.lookahead().as_secs();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            origin,
            state: Mutex::new(QueueState {
                cutoff,
                ..Default::default()
            }),
            admission: Mutex::new(()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            available: Notify::new(),
            demand: Notify::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bucket(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_secs()
    }

    /// Pending jobs usable beyond the near-term cutoff.
    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    pub fn taken_count(&self) -> usize {
        self.lock().taken.values().map(Vec::len).sum()
    }

    /// Resolves when the queue has run low or a worker found it empty.
    pub async fn wait_for_demand(&self) {
        self.demand.notified().await;
    }

    pub fn add_job(&self, job: Arc<Job>) -> bool {
        self.add_jobs(vec![job]) == 1
    }

    /// Admit a batch of freshly fetched jobs; returns how many were queued.
    ///
    /// Jobs for a block that was already superseded are dropped, and their
    /// work is credited to the source's deferred balance.
    pub fn add_jobs(&self, jobs: Vec<Arc<Job>>) -> usize {
        let Some(me) = self.me.upgrade() else {
            return 0;
        };

        let mut stale = Vec::new();
        let mut to_cancel = Vec::new();
        let mut admitted = 0;
        {
            let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
            for job in jobs {
                if !self.is_running() {
                    job.destroy();
                    continue;
                }
                match job.blockchain().check_job(&job) {
                    BlockCheck::Stale => {
                        stale.push(job);
                        continue;
                    }
                    BlockCheck::NewBlock { to_cancel: claimed } => to_cancel.extend(claimed),
                    BlockCheck::Current => {}
                }

                job.attach_queue(&me);
                job.register();
                let bucket = self.bucket(job.expiry());
                self.lock().insert(bucket, job);
                admitted += 1;
            }
        }

        for job in stale {
            debug!(
                source = %job.source().name(),
                blockchain = %job.blockchain().name(),
                job = job.id(),
                "Dropping job for a superseded block"
            );
            job.source().add_deferred_mhashes(job_mhashes());
            job.destroy();
        }
        if !to_cancel.is_empty() {
            self.cancel_later(to_cancel, false);
        }
        if admitted > 0 {
            self.available.notify_waiters();
        }
        admitted
    }

    /// Claim the job best suited to run until `now + min_ahead`, without
    /// waiting.
    ///
    /// Prefers the soonest-expiring job that still lasts past the horizon;
    /// failing that, the latest-expiring job that does not.
    pub fn try_get_job(&self, worker: &Arc<Worker>, min_ahead: Duration) -> Option<Arc<Job>> {
        loop {
            let job = self.claim(min_ahead)?;
            if !job.set_worker(worker) || job.is_canceled() {
                // Flushed or canceled between the claim and the assignment.
                job.destroy();
                continue;
            }
            trace!(worker = %worker.name(), job = job.id(), "Job claimed");
            return Some(job);
        }
    }

    fn claim(&self, min_ahead: Duration) -> Option<Arc<Job>> {
        let now = Instant::now();
        let horizon = now + min_ahead;
        let horizon_bucket = self.bucket(horizon);

        let mut state = self.lock();

        // Smallest expiry past the horizon.
        let mut found = None;
        for (&bucket, jobs) in state.pending.range(horizon_bucket..) {
            found = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.expiry() > horizon)
                .min_by_key(|(_, job)| job.expiry())
                .map(|(index, _)| (bucket, index));
            if found.is_some() {
                break;
            }
        }

        // Otherwise the freshest job that is not yet expired.
        if found.is_none() {
            for (&bucket, jobs) in state.pending.range(..=horizon_bucket).rev() {
                found = jobs
                    .iter()
                    .enumerate()
                    .filter(|(_, job)| job.expiry() > now && job.expiry() <= horizon)
                    .max_by_key(|(_, job)| job.expiry())
                    .map(|(index, _)| (bucket, index));
                if found.is_some() {
                    break;
                }
            }
        }

        let (bucket, index) = found?;
        let job = state.take_pending(bucket, index)?;
        state.taken.entry(bucket).or_default().push(job.clone());
        drop(state);

        self.demand.notify_one();
        Some(job)
    }

    /// Claim a job for `worker`, waiting for one if the queue is empty.
    ///
    /// Returns `None` only once the queue is stopped. A worker calling in
    /// before the queue starts waits for the start.
    pub async fn get_job(&self, worker: &Arc<Worker>, min_ahead: Duration) -> Option<Arc<Job>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if self.is_running() {
                if let Some(job) = self.try_get_job(worker, min_ahead) {
                    return Some(job);
                }
                trace!(worker = %worker.name(), "Queue empty, waiting for work");
                self.demand.notify_one();
            } else {
                trace!(worker = %worker.name(), "Queue not started, waiting");
            }
            notified.await;
        }
    }

    /// Forget a job. Called from job teardown.
    pub(crate) fn remove_job(&self, job: &Job) {
        let bucket = self.bucket(job.expiry());
        let mut state = self.lock();

        if let Some(index) = state
            .pending
            .get(&bucket)
            .and_then(|jobs| jobs.iter().position(|j| j.id() == job.id()))
        {
            state.take_pending(bucket, index);
            drop(state);
            self.demand.notify_one();
            return;
        }

        if let Some(jobs) = state.taken.get_mut(&bucket) {
            jobs.retain(|j| j.id() != job.id());
            if jobs.is_empty() {
                state.taken.remove(&bucket);
            }
        }
    }

    /// Drop all queued work of `source` and everything below it: pending jobs
    /// are destroyed, claimed ones canceled.
    pub fn flush_all_of_work_source(&self, source: &Arc<WorkSourceNode>) -> usize {
        let belongs = |job: &Arc<Job>| is_within(job.source(), source);
        let (pending, taken) = {
            let mut state = self.lock();
            (state.drain_pending(belongs), state.drain_taken(belongs))
        };

        let flushed = pending.len() + taken.len();
        if flushed > 0 {
            info!(
                source = %source.name(),
                pending = pending.len(),
                taken = taken.len(),
                "Flushed work source"
            );
        }
        for job in pending {
            job.destroy();
        }
        if !taken.is_empty() {
            self.cancel_later(taken, false);
        }
        self.demand.notify_one();
        flushed
    }

    /// Advance the near-term cutoff and evict expired jobs.
    pub fn sweep(&self) {
        let now = Instant::now();
        let cutoff = self.bucket(now + self.config.queue.lookahead());

        let (expired, overdue) = {
            let mut state = self.lock();
            if cutoff > state.cutoff {
                let crossing: usize = state
                    .pending
                    .range(state.cutoff + 1..=cutoff)
                    .map(|(_, jobs)| jobs.len())
                    .sum();
                state.depth -= crossing;
                state.cutoff = cutoff;
            }
            (
                state.drain_pending(|job| job.expiry() <= now),
                state.drain_taken(|job| job.expiry() <= now),
            )
        };

        if !expired.is_empty() || !overdue.is_empty() {
            debug!(
                pending = expired.len(),
                taken = overdue.len(),
                "Swept expired jobs"
            );
        }
        for job in expired {
            job.destroy();
        }
        for job in overdue {
            job.cancel(true);
        }
        self.demand.notify_one();
        self.available.notify_waiters();
    }

    fn cancel_later(&self, jobs: Vec<Arc<Job>>, graceful: bool) {
        let sender = self.lock().cancel_tx.clone();
        let batch = CancelBatch { jobs, graceful };
        let batch = match sender {
            Some(tx) => match tx.send(batch) {
                Ok(()) => return,
                Err(mpsc::error::SendError(batch)) => batch,
            },
            None => batch,
        };
        // No cancel task; do it here.
        for job in batch.jobs {
            job.cancel(batch.graceful);
        }
    }

    async fn sweep_task(queue: Arc<WorkQueue>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(queue.config.queue.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => queue.sweep(),
            }
        }
        trace!("Sweep task stopped");
    }

    async fn cancel_task(rx: mpsc::UnboundedReceiver<CancelBatch>) {
        let mut batches = UnboundedReceiverStream::new(rx);
        while let Some(batch) = batches.next().await {
            trace!(jobs = batch.jobs.len(), graceful = batch.graceful, "Canceling jobs");
            for job in batch.jobs {
                job.cancel(batch.graceful);
            }
        }
        trace!("Cancel task stopped");
    }
}

/// Whether `node` is `ancestor` or below it.
fn is_within(node: &Arc<WorkSourceNode>, ancestor: &Arc<WorkSourceNode>) -> bool {
    let mut current = Some(node.clone());
    while let Some(n) = current {
        if Arc::ptr_eq(&n, ancestor) {
            return true;
        }
        current = n.parent();
    }
    false
}

#[async_trait]
impl Startable for WorkQueue {
    async fn start(&self) -> crate::Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.cancel_tx = Some(tx);
            state.shutdown = Some(shutdown.clone());
        }
        self.tracker.reopen();
        self.tracker.spawn(Self::sweep_task(me, shutdown));
        self.tracker.spawn(Self::cancel_task(rx));
        self.stopped.store(false, Ordering::Release);
        self.available.notify_waiters();
        debug!("Work queue started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stopped.store(true, Ordering::Release);

        // Serialize with producers mid-admission.
        let (pending, taken) = {
            let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
            let mut state = self.lock();
            if let Some(shutdown) = state.shutdown.take() {
                shutdown.cancel();
            }
            // Dropping the sender ends the cancel task once it drains.
            state.cancel_tx = None;
            (state.drain_pending(|_| true), state.drain_taken(|_| true))
        };
        self.available.notify_waiters();

        for job in pending {
            job.destroy();
        }
        for job in taken {
            job.cancel(false);
        }

        self.tracker.close();
        let timeout = self.config.queue.shutdown_timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(?timeout, "Work queue tasks did not stop in time");
        }
        debug!("Work queue stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
