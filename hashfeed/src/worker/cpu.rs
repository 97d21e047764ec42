//! CPU hashing device.
//!
//! Hashes on the blocking thread pool in duty-cycled chunks: each one-second
//! cycle spends `duty_percent` of its time in [`scan`] and sleeps the rest.
//! Progress and candidate nonces are reported to the job after every chunk,
//! so a canceled job is abandoned within one cycle.
//!
//! This prioritizes readability over speed. The midstate saves about half
//! the work of a naive double SHA-256; no SIMD is attempted, so expect a few
//! MH/s per thread. Good enough to exercise the scheduler end to end.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::{sha256, Hash, HashEngine};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Device, Worker, WorkerError};
use crate::job::Job;
use crate::tracing::prelude::*;
use crate::types::{HashRate, HEADER_LEN, NONCE_SPACE};
use crate::work_queue::WorkQueue;

const CYCLE: Duration = Duration::from_secs(1);

/// Hashes between clock reads inside a chunk.
const CLOCK_INTERVAL: u64 = 4096;

/// Rate changes smaller than this fraction are not reported.
const RATE_REPORT_THRESHOLD: f64 = 0.1;

/// Result of hashing a nonce range.
#[derive(Debug, Default)]
pub struct Scan {
    pub hashes: u64,
    /// Nonces whose hash has its top 32 bits clear.
    pub candidates: Vec<u32>,
}

/// Hash nonces `start..start + count` of `header` until done or `deadline`.
///
/// Only the final 16 header bytes are hashed per nonce; the first 64 come
/// from `midstate`.
pub fn scan(
    header: &[u8; HEADER_LEN],
    midstate: sha256::Midstate,
    start: u64,
    count: u64,
    deadline: std::time::Instant,
) -> Scan {
    let mut tail = [0u8; 16];
    tail.copy_from_slice(&header[64..]);

    let mut result = Scan::default();
    while result.hashes < count {
        if result.hashes % CLOCK_INTERVAL == 0
            && result.hashes > 0
            && std::time::Instant::now() >= deadline
        {
            break;
        }

        let nonce = (start + result.hashes) as u32;
        tail[12..].copy_from_slice(&nonce.to_le_bytes());
        let mut engine = sha256::HashEngine::from_midstate(midstate, 64);
        engine.input(&tail);
        let first = sha256::Hash::from_engine(engine);
        let second = sha256::Hash::hash(first.as_byte_array());

        if second.as_byte_array()[28..] == [0u8; 4] {
            result.candidates.push(nonce);
        }
        result.hashes += 1;
    }
    result
}

pub struct CpuDevice {
    name: String,
    work: Duration,
    idle: Duration,
    /// Cuts the idle part of a cycle short when a job is canceled.
    canceled: Notify,
}

impl CpuDevice {
    pub fn new(name: impl Into<String>, duty_percent: u8) -> Arc<Self> {
        let work = CYCLE * u32::from(duty_percent.clamp(1, 100)) / 100;
        Arc::new(Self {
            name: name.into(),
            work,
            idle: CYCLE - work,
            canceled: Notify::new(),
        })
    }

    /// Pull jobs from `queue` and hash them until shutdown.
    pub async fn run(
        self: Arc<Self>,
        worker: Arc<Worker>,
        queue: Arc<WorkQueue>,
        min_ahead: Duration,
        shutdown: CancellationToken,
    ) {
        debug!(device = %self.name, work = ?self.work, idle = ?self.idle, "CPU device running");
        let mut rate = RateMeter::default();
        worker.set_rates(HashRate::default(), 1);

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = queue.get_job(&worker, min_ahead) => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.mine(&worker, &job, &mut rate, &shutdown).await;
            // Finished, abandoned after a cancel, or interrupted by shutdown:
            // either way the job is done with.
            job.destroy();
        }
        debug!(device = %self.name, "CPU device stopped");
    }

    async fn mine(
        &self,
        worker: &Arc<Worker>,
        job: &Arc<Job>,
        rate: &mut RateMeter,
        shutdown: &CancellationToken,
    ) {
        let mut next = NONCE_SPACE - job.hashes_remaining();

        while next < NONCE_SPACE && !job.is_canceled() && !shutdown.is_cancelled() {
            let cycle_start = Instant::now();
            let header = *job.header();
            let midstate = *job.midstate();
            let count = NONCE_SPACE - next;
            let deadline = std::time::Instant::now() + self.work;

            let chunk = match tokio::task::spawn_blocking(move || {
                scan(&header, midstate, next, count, deadline)
            })
            .await
            {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(device = %self.name, job = job.id(), error = %e, "Hashing task failed");
                    return;
                }
            };

            next += chunk.hashes;
            job.hashes_processed(chunk.hashes);
            if job.is_destroyed() {
                // Canceled outright while we were hashing.
                return;
            }
            for nonce in chunk.candidates {
                job.nonce_found(nonce);
            }

            if next < NONCE_SPACE && !self.idle.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = self.canceled.notified() => {}
                    _ = tokio::time::sleep(self.idle) => {}
                }
            }

            if let Some(hashrate) = rate.record(chunk.hashes, cycle_start.elapsed()) {
                worker.set_rates(hashrate, 1);
            }
        }

        if job.is_canceled() {
            debug!(device = %self.name, job = job.id(), "Abandoning canceled job");
        }
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify_canceled(&self, _job: &Arc<Job>, _graceful: bool) -> Result<(), WorkerError> {
        self.canceled.notify_one();
        Ok(())
    }
}

/// Smoothed hashrate that only reports meaningful changes.
#[derive(Debug, Default)]
struct RateMeter {
    smoothed: f64,
    reported: f64,
}

impl RateMeter {
    const ALPHA: f64 = 0.3;

    fn record(&mut self, hashes: u64, elapsed: Duration) -> Option<HashRate> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let sample = hashes as f64 / secs;
        self.smoothed = if self.smoothed == 0.0 {
            sample
        } else {
            Self::ALPHA * sample + (1.0 - Self::ALPHA) * self.smoothed
        };

        let change = (self.smoothed - self.reported).abs();
        if self.reported == 0.0 || change > self.reported * RATE_REPORT_THRESHOLD {
            self.reported = self.smoothed;
            Some(HashRate(self.smoothed as u64))
        } else {
            None
        }
    }
}
