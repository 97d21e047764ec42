//! Keeps the work queue stocked.
//!
//! The fetcher sizes the queue from the aggregate speed of all workers and
//! starts one short-lived producer task per missing job. Each producer asks
//! the root work source for work once, queues whatever comes back and exits.
//! No fixed pool of fetch tasks exists: the number in flight follows the
//! deficit between the target and what is already queued or on its way.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::lifecycle::Startable;
use crate::tracing::prelude::*;
use crate::work_queue::WorkQueue;
use crate::work_source::{FetchContext, WorkSourceNode};
use crate::worker::WorkerSet;

/// Raised by workers when their speed changes.
#[derive(Debug, Default)]
pub struct SpeedSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl SpeedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Clear the signal, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Jobs to keep queued: enough for every parallel slot and for
/// `buffer_secs` of hashing at the aggregate rate.
pub fn queue_target(
    min_target: usize,
    buffer_secs: f64,
    parallel_jobs: usize,
    jobs_per_second: f64,
) -> usize {
    let by_rate = (buffer_secs * jobs_per_second).ceil();
    let by_rate = if by_rate.is_finite() && by_rate > 0.0 {
        by_rate as usize
    } else {
        0
    };
    min_target.max(parallel_jobs).max(by_rate)
}

/// Producers to start so that queued plus in-flight work meets the target.
pub fn deficit(target: usize, depth: usize, in_flight: usize) -> usize {
    target.saturating_sub(depth + in_flight)
}

pub struct Fetcher {
    me: Weak<Fetcher>,
    config: Arc<SchedulerConfig>,
    queue: Arc<WorkQueue>,
    workers: Arc<WorkerSet>,
    speed: Arc<SpeedSignal>,
    root: RwLock<Option<Arc<WorkSourceNode>>>,
    target: AtomicUsize,
    in_flight: AtomicUsize,
    /// A producer finished.
    finished: Notify,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl Fetcher {
    pub fn new(
        config: Arc<SchedulerConfig>,
        queue: Arc<WorkQueue>,
        workers: Arc<WorkerSet>,
        speed: Arc<SpeedSignal>,
    ) -> Arc<Self> {
        let target = config.queue.min_target;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            queue,
            workers,
            speed,
            root: RwLock::new(None),
            target: AtomicUsize::new(target),
            in_flight: AtomicUsize::new(0),
            finished: Notify::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tracker: TaskTracker::new(),
        })
    }

    pub fn set_root(&self, root: Option<Arc<WorkSourceNode>>) {
        *self.root.write().unwrap_or_else(|e| e.into_inner()) = root;
        self.finished.notify_one();
    }

    fn root(&self) -> Option<Arc<WorkSourceNode>> {
        self.root.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn queue_target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Recompute the queue target from the workers' reported rates.
    pub fn update_target(&self) -> usize {
        let (parallel_jobs, jobs_per_second) = self.workers.totals();
        let q = &self.config.queue;
        let target = queue_target(q.min_target, q.buffer_secs, parallel_jobs, jobs_per_second);
        let old = self.target.swap(target, Ordering::AcqRel);
        if old != target {
            debug!(old, new = target, jobs_per_second, parallel_jobs, "Queue target changed");
        }
        target
    }

    /// Seconds the queue target lasts at the current aggregate rate.
    fn queue_delay_secs(&self) -> f64 {
        let (_, jobs_per_second) = self.workers.totals();
        if jobs_per_second > 0.0 {
            self.queue_target() as f64 / jobs_per_second
        } else {
            0.0
        }
    }

    /// Start producers for the current deficit. Returns how many started.
    pub fn top_up(&self) -> usize {
        let Some(me) = self.me.upgrade() else {
            return 0;
        };
        let Some(shutdown) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return 0;
        };
        let Some(root) = self.root() else {
            return 0;
        };

        let missing = deficit(self.queue_target(), self.queue.depth(), self.in_flight());
        for _ in 0..missing {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            self.tracker
                .spawn(Self::produce(me.clone(), root.clone(), shutdown.clone()));
        }
        if missing > 0 {
            trace!(started = missing, in_flight = self.in_flight(), "Started producers");
        }
        missing
    }

    async fn produce(me: Arc<Fetcher>, root: Arc<WorkSourceNode>, shutdown: CancellationToken) {
        let ctx = FetchContext {
            queue_delay_secs: me.queue_delay_secs(),
        };
        let result = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = root.get_job(&ctx) => Some(result),
        };

        let retry = match result {
            Some(Ok(jobs)) if !jobs.is_empty() => {
                let fetched = jobs.len();
                let admitted = me.queue.add_jobs(jobs);
                trace!(fetched, admitted, "Producer queued jobs");
                false
            }
            Some(Ok(_)) => {
                trace!("No work source had work");
                true
            }
            Some(Err(e)) => {
                debug!(error = %e, "Fetch failed");
                true
            }
            None => false,
        };

        // Hold the slot for a while so an empty tree is not hammered.
        if retry {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(me.config.queue.fetch_retry()) => {}
            }
        }

        me.in_flight.fetch_sub(1, Ordering::AcqRel);
        me.finished.notify_one();
    }

    async fn control_loop(me: Arc<Fetcher>, shutdown: CancellationToken) {
        me.speed.take();
        me.update_target();
        loop {
            if me.speed.take() {
                me.update_target();
            }
            me.top_up();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = me.speed.notified() => {}
                _ = me.queue.wait_for_demand() => {}
                _ = me.finished.notified() => {}
            }
        }
        trace!("Fetcher control loop stopped");
    }
}

#[async_trait]
impl Startable for Fetcher {
    async fn start(&self) -> crate::Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown.clone());
        self.tracker.reopen();
        self.tracker.spawn(Self::control_loop(me, shutdown));
        debug!("Fetcher started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shutdown) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            shutdown.cancel();
        }

        self.tracker.close();
        let timeout = self.config.queue.shutdown_timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(?timeout, "Fetcher tasks did not stop in time");
        }
        debug!("Fetcher stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
