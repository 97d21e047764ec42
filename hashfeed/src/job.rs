//! Jobs: one full nonce range over a fixed block header.
//!
//! A job is fetched from a leaf work source, admitted into the
//! [`WorkQueue`](crate::work_queue::WorkQueue) (which registers it with its
//! blockchain), claimed by a worker, and finally destroyed. Destruction can
//! be triggered from several places at once (normal completion, a new block,
//! expiry, an explicit cancel) and runs exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::blockchain::Blockchain;
use crate::tracing::prelude::*;
use crate::types::{
    hash_difficulty, mhashes, target_difficulty, BlockHash, BlockHeader, Target, HEADER_LEN,
    NONCE_SPACE,
};
use crate::work_queue::WorkQueue;
use crate::work_source::{ShareSubmission, ShareVerdict, WorkSourceNode};
use crate::worker::Worker;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

const NONCE_OFFSET: usize = 76;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Header must be {HEADER_LEN} bytes, got {0}")]
    HeaderLength(usize),

    #[error("Malformed header: {0}")]
    Header(String),
}

/// Work as delivered by a job source adapter.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    /// Serialized 80-byte block header. The nonce field is ignored.
    pub header: Vec<u8>,
    /// Share target.
    pub target: Target,
    /// How long the job stays useful after it was fetched.
    pub lifetime: Duration,
    /// SHA-256 state after the first 64 header bytes, if the source has it.
    pub midstate: Option<sha256::Midstate>,
    /// The source's own identifier, echoed back on submission.
    pub source_job_id: Option<String>,
}

impl JobTemplate {
    pub fn new(header: &BlockHeader, target: Target, lifetime: Duration) -> Self {
        Self {
            header: bitcoin::consensus::serialize(header),
            target,
            lifetime,
            midstate: None,
            source_job_id: None,
        }
    }

    pub fn with_source_job_id(mut self, id: impl Into<String>) -> Self {
        self.source_job_id = Some(id.into());
        self
    }
}

/// How a candidate hash compares to a share target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareCheck {
    /// The top 32 bits of the hash are not zero: the device returned a nonce
    /// that cannot be a real solution.
    Invalid,
    BelowTarget,
    MeetsTarget,
}

/// Classify `hash` against `target`. A hash equal to the target meets it.
pub fn check_share(hash: &BlockHash, target: &Target) -> ShareCheck {
    if hash.as_byte_array()[28..] != [0u8; 4] {
        ShareCheck::Invalid
    } else if target.is_met_by(*hash) {
        ShareCheck::MeetsTarget
    } else {
        ShareCheck::BelowTarget
    }
}

/// What happened to a nonce reported by a device.
#[derive(Debug)]
pub enum NonceOutcome {
    Invalid,
    BelowTarget { difficulty: f64 },
    /// Submitted to the work source in the background.
    Submitted {
        difficulty: f64,
        upload: JoinHandle<()>,
    },
}

struct JobState {
    hashes_remaining: u64,
    worker: Option<Arc<Worker>>,
    registered: bool,
}

pub struct Job {
    id: u64,
    source: Arc<WorkSourceNode>,
    blockchain: Arc<Blockchain>,
    queue: OnceLock<Weak<WorkQueue>>,
    expiry: Instant,
    header: [u8; HEADER_LEN],
    midstate: sha256::Midstate,
    target: Target,
    prevhash: BlockHash,
    source_job_id: Option<String>,
    state: Mutex<JobState>,
    canceled: AtomicBool,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("prevhash", &self.prevhash)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Job {
    pub fn new(
        source: Arc<WorkSourceNode>,
        blockchain: Arc<Blockchain>,
        template: JobTemplate,
    ) -> Result<Arc<Self>, JobError> {
        let header: [u8; HEADER_LEN] = template
            .header
            .as_slice()
            .try_into()
            .map_err(|_| JobError::HeaderLength(template.header.len()))?;
        let decoded: BlockHeader = bitcoin::consensus::deserialize(&header)
            .map_err(|e| JobError::Header(e.to_string()))?;

        let midstate = template.midstate.unwrap_or_else(|| {
            let mut engine = sha256::HashEngine::default();
            engine.input(&header[..64]);
            engine.midstate()
        });

        Ok(Arc::new(Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            source,
            blockchain,
            queue: OnceLock::new(),
            expiry: Instant::now() + template.lifetime,
            header,
            midstate,
            target: template.target,
            prevhash: decoded.prev_blockhash,
            source_job_id: template.source_job_id,
            state: Mutex::new(JobState {
                hashes_remaining: NONCE_SPACE,
                worker: None,
                registered: false,
            }),
            canceled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &Arc<WorkSourceNode> {
        &self.source
    }

    pub fn blockchain(&self) -> &Arc<Blockchain> {
        &self.blockchain
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    pub fn midstate(&self) -> &sha256::Midstate {
        &self.midstate
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn prevhash(&self) -> BlockHash {
        self.prevhash
    }

    pub fn source_job_id(&self) -> Option<&str> {
        self.source_job_id.as_deref()
    }

    pub fn difficulty(&self) -> f64 {
        target_difficulty(&self.target)
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn hashes_remaining(&self) -> u64 {
        self.lock().hashes_remaining
    }

    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.lock().worker.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn attach_queue(&self, queue: &Arc<WorkQueue>) {
        let _ = self.queue.set(Arc::downgrade(queue));
    }

    fn queue(&self) -> Option<Arc<WorkQueue>> {
        self.queue.get().and_then(Weak::upgrade)
    }

    /// Attach to the blockchain and debit the source for a full nonce range.
    pub fn register(self: &Arc<Self>) {
        let remaining = {
            let mut state = self.lock();
            if state.registered || self.is_destroyed() {
                return;
            }
            state.registered = true;
            self.blockchain.add_job(self.clone());
            state.hashes_remaining
        };
        self.source.add_pending_mhashes(-mhashes(remaining));
    }

    /// Tear the job down. Only the first call has any effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (remaining, worker, registered) = {
            let state = self.lock();
            (state.hashes_remaining, state.worker.clone(), state.registered)
        };

        self.blockchain.remove_job(self);
        if let Some(queue) = self.queue() {
            queue.remove_job(self);
        }

        if registered {
            self.source.add_pending_mhashes(mhashes(remaining));
        }
        if let Some(worker) = worker {
            let done = NONCE_SPACE - remaining;
            worker.record_hashes(done);
            self.source.add_processed(done);
            self.source.record_job_finished();
        }
        trace!(job = self.id, remaining, "Job destroyed");
    }

    /// Record progress. Ignored once the job is destroyed.
    pub fn hashes_processed(&self, hashes: u64) {
        let mut state = self.lock();
        if self.is_destroyed() {
            return;
        }
        state.hashes_remaining = state.hashes_remaining.saturating_sub(hashes);
    }

    /// Bind the job to `worker`. Returns false, binding nothing, if the job
    /// was already destroyed.
    pub fn set_worker(&self, worker: &Arc<Worker>) -> bool {
        {
            let mut state = self.lock();
            // destroy() flips the flag before reading the worker under this
            // lock, so either it sees our worker or we see the flag.
            if self.is_destroyed() {
                return false;
            }
            state.worker = Some(worker.clone());
        }
        self.source.record_job_accepted();
        worker.record_job_accepted();
        debug!(
            worker = %worker.name(),
            source = %self.source.name(),
            job = self.id,
            "Mining job"
        );
        true
    }

    /// Check a nonce from the device and, if it meets the target, upload it
    /// to the work source in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn nonce_found(self: &Arc<Self>, nonce: u32) -> NonceOutcome {
        let mut header = self.header;
        header[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        let hash = BlockHash::from_raw_hash(sha256d::Hash::hash(&header));

        match check_share(&hash, &self.target) {
            ShareCheck::Invalid => {
                warn!(
                    source = %self.source.name(),
                    job = self.id,
                    nonce = format!("{:08x}", nonce),
                    "Invalid nonce: low-order bits not zero"
                );
                if let Some(worker) = self.worker() {
                    worker.record_invalid();
                }
                NonceOutcome::Invalid
            }
            ShareCheck::BelowTarget => {
                let difficulty = hash_difficulty(&hash);
                debug!(
                    source = %self.source.name(),
                    job = self.id,
                    nonce = format!("{:08x}", nonce),
                    difficulty,
                    "Share didn't meet difficulty"
                );
                if let Some(worker) = self.worker() {
                    worker.record_below_target();
                }
                NonceOutcome::BelowTarget { difficulty }
            }
            ShareCheck::MeetsTarget => {
                let difficulty = hash_difficulty(&hash);
                info!(
                    source = %self.source.name(),
                    job = self.id,
                    nonce = format!("{:08x}", nonce),
                    difficulty,
                    "Found share"
                );
                let job = self.clone();
                let upload = tokio::spawn(async move {
                    job.upload(header, nonce, difficulty).await;
                });
                NonceOutcome::Submitted { difficulty, upload }
            }
        }
    }

    async fn upload(&self, header: [u8; HEADER_LEN], nonce: u32, difficulty: f64) {
        let policy = self.source.config().upload.clone();
        let share = ShareSubmission {
            source_job_id: self.source_job_id.clone(),
            header,
            nonce,
            difficulty,
        };

        for attempt in 1..=policy.max_attempts {
            match self.source.submit(&share).await {
                Ok(verdict) => {
                    self.nonce_handled(nonce, difficulty, verdict);
                    return;
                }
                Err(e) => {
                    warn!(
                        source = %self.source.name(),
                        job = self.id,
                        nonce = format!("{:08x}", nonce),
                        attempt,
                        error = %e,
                        "Share upload failed"
                    );
                    if attempt < policy.max_attempts {
                        self.source.record_upload_retry();
                        tokio::time::sleep(policy.retry_delay()).await;
                    }
                }
            }
        }

        self.nonce_handled(nonce, difficulty, ShareVerdict::Rejected(None));
    }

    /// Book the work source's verdict on a share from this job.
    pub fn nonce_handled(&self, nonce: u32, difficulty: f64, verdict: ShareVerdict) {
        self.source.record_share(&verdict, self.difficulty());
        if let Some(worker) = self.worker() {
            worker.record_share(verdict.is_accepted());
        }

        if verdict.is_accepted() {
            info!(
                source = %self.source.name(),
                job = self.id,
                nonce = format!("{:08x}", nonce),
                difficulty,
                "Share accepted"
            );
        } else {
            warn!(
                source = %self.source.name(),
                job = self.id,
                nonce = format!("{:08x}", nonce),
                difficulty,
                reason = %verdict.reason(),
                "Share rejected"
            );
        }
    }

    /// Cancel the job. A graceful cancel lets the worker finish its current
    /// batch and destroy the job itself; an ungraceful one destroys it now.
    pub fn cancel(self: &Arc<Self>, graceful: bool) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }

        let worker = self.worker();
        self.source.record_job_canceled();
        if let Some(worker) = &worker {
            worker.record_job_canceled();
        }

        if !graceful || worker.is_none() {
            self.destroy();
        } else if let Some(queue) = self.queue() {
            queue.remove_job(self);
        }

        if let Some(worker) = worker {
            if let Err(e) = worker.notify_canceled(self, graceful) {
                warn!(
                    worker = %worker.name(),
                    job = self.id,
                    error = %e,
                    "Failed to notify worker of canceled job"
                );
            }
        }
        trace!(job = self.id, graceful, "Job canceled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::lifecycle::Startable;
    use crate::statistics::StatisticsSource;
    use crate::types::job_mhashes;
    use crate::work_source::testing::{template, ScriptedSource};
    use crate::work_source::{SourceError, SourceSettings};
    use crate::worker::testing::test_worker;

    const GENESIS_NONCE: u32 = 2_083_236_893;

    async fn running_leaf(source: &Arc<ScriptedSource>) -> Arc<WorkSourceNode> {
        let mut config = SchedulerConfig::default();
        config.upload.max_attempts = 3;
        let node = WorkSourceNode::leaf(
            SourceSettings::named("pool"),
            source.clone(),
            None,
            Arc::new(config),
        );
        node.start().await.unwrap();
        node
    }

    fn genesis_template(target: Target) -> JobTemplate {
        let header = bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Bitcoin).header;
        JobTemplate::new(&header, target, Duration::from_secs(60))
    }

    fn genesis_hash() -> BlockHash {
        bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Bitcoin)
            .header
            .block_hash()
    }

    fn job(node: &Arc<WorkSourceNode>, template: JobTemplate) -> Arc<Job> {
        Job::new(node.clone(), node.job_blockchain().unwrap(), template).unwrap()
    }

    #[test]
    fn test_hash_equal_to_target_meets_it() {
        let hash = genesis_hash();
        let target = Target::from_le_bytes(hash.to_byte_array());
        assert_eq!(check_share(&hash, &target), ShareCheck::MeetsTarget);

        // One less than the hash: the hash is now above the target.
        let mut le = hash.to_byte_array();
        le[0] -= 1;
        let target = Target::from_le_bytes(le);
        assert_eq!(check_share(&hash, &target), ShareCheck::BelowTarget);
    }

    #[test]
    fn test_high_bits_set_is_invalid() {
        let mut le = [0u8; 32];
        le[31] = 0x01;
        let hash = BlockHash::from_byte_array(le);
        assert_eq!(check_share(&hash, &Target::MAX), ShareCheck::Invalid);
    }

    #[tokio::test]
    async fn test_rejects_short_header() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let mut bad = template(1, 60);
        bad.header.truncate(79);
        let err = Job::new(node.clone(), node.job_blockchain().unwrap(), bad).unwrap_err();
        assert!(matches!(err, JobError::HeaderLength(79)));
    }

    #[tokio::test]
    async fn test_prevhash_and_midstate_from_header() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let job = job(&node, genesis_template(Target::MAX));

        assert_eq!(job.prevhash(), BlockHash::all_zeros());
        let mut engine = sha256::HashEngine::default();
        engine.input(&job.header()[..64]);
        assert_eq!(*job.midstate(), engine.midstate());
        assert!((job.difficulty() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let job = job(&node, template(1, 60));

        job.register();
        assert_eq!(node.job_blockchain().unwrap().job_count(), 1);
        assert!((node.bias_snapshot().pending_mhashes + job_mhashes()).abs() < 1e-6);

        job.destroy();
        job.destroy();
        job.cancel(false);
        assert!(node.bias_snapshot().pending_mhashes.abs() < 1e-6);
        assert_eq!(node.job_blockchain().unwrap().job_count(), 0);
    }

    #[tokio::test]
    async fn test_processed_hashes_credited_once() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let (worker, _device) = test_worker("cpu0");
        let job = job(&node, template(1, 60));
        job.register();
        job.set_worker(&worker);

        job.hashes_processed(1_000_000);
        job.hashes_processed(3_000_000);
        job.destroy();
        job.hashes_processed(5_000_000);
        job.destroy();

        assert_eq!(job.hashes_remaining(), NONCE_SPACE - 4_000_000);
        assert!((worker.get_statistics().ghashes - 0.004).abs() < 1e-12);
        assert!((node.get_statistics().ghashes - 0.004).abs() < 1e-12);
        // The unhashed remainder went back; only 4 MH stay debited.
        assert!((node.bias_snapshot().pending_mhashes + 4.0).abs() < 1e-6);
        assert_eq!(node.get_statistics().jobs_accepted, 1);
    }

    #[tokio::test]
    async fn test_winning_nonce_is_submitted() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let (worker, _device) = test_worker("cpu0");
        let job = job(&node, genesis_template(Target::MAX));
        job.set_worker(&worker);

        let NonceOutcome::Submitted { difficulty, upload } = job.nonce_found(GENESIS_NONCE) else {
            panic!("winning nonce not submitted");
        };
        assert!(difficulty > 1.0);
        upload.await.unwrap();

        let submissions = source.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].nonce, GENESIS_NONCE);
        assert_eq!(&submissions[0].header[76..], &GENESIS_NONCE.to_le_bytes());

        assert_eq!(node.get_statistics().shares_accepted, 1);
        assert_eq!(worker.get_statistics().shares_accepted, 1);
        assert!((node.score() - 4000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_nonce_above_share_target() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let mut le = genesis_hash().to_byte_array();
        le[0] -= 1;
        let job = job(&node, genesis_template(Target::from_le_bytes(le)));

        assert!(matches!(
            job.nonce_found(GENESIS_NONCE),
            NonceOutcome::BelowTarget { .. }
        ));
        assert!(source.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_nonce_is_invalid() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let (worker, _device) = test_worker("cpu0");
        let job = job(&node, genesis_template(Target::MAX));
        job.set_worker(&worker);

        assert!(matches!(
            job.nonce_found(GENESIS_NONCE.wrapping_add(1)),
            NonceOutcome::Invalid
        ));
        assert_eq!(worker.get_statistics().shares_invalid, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retries_then_succeeds() {
        let source = ScriptedSource::new();
        source.push_verdict(Err(SourceError::Timeout));
        source.push_verdict(Err(SourceError::Timeout));
        let node = running_leaf(&source).await;
        let job = job(&node, genesis_template(Target::MAX));

        let NonceOutcome::Submitted { upload, .. } = job.nonce_found(GENESIS_NONCE) else {
            panic!("winning nonce not submitted");
        };
        upload.await.unwrap();

        let stats = node.get_statistics();
        assert_eq!(stats.upload_retries, 2);
        assert_eq!(stats.shares_accepted, 1);
        assert!((node.score() - 3800.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_gives_up_as_rejected() {
        let source = ScriptedSource::new();
        for _ in 0..3 {
            source.push_verdict(Err(SourceError::Connection("refused".into())));
        }
        let node = running_leaf(&source).await;
        let job = job(&node, genesis_template(Target::MAX));

        let NonceOutcome::Submitted { upload, .. } = job.nonce_found(GENESIS_NONCE) else {
            panic!("winning nonce not submitted");
        };
        upload.await.unwrap();

        let stats = node.get_statistics();
        assert_eq!(source.submissions().len(), 3);
        assert_eq!(stats.upload_retries, 2);
        assert_eq!(stats.shares_rejected, 1);
        assert!(node.is_locked_out());
    }

    #[tokio::test]
    async fn test_cancel_survives_failing_device() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let (worker, device) = test_worker("cpu0");
        device.fail_cancels();
        let job = job(&node, template(1, 60));
        job.register();
        job.set_worker(&worker);

        job.cancel(false);
        assert!(job.is_canceled());
        assert!(job.is_destroyed());
        assert_eq!(device.canceled(), vec![(job.id(), false)]);
        assert_eq!(worker.get_statistics().jobs_canceled, 1);
    }

    #[tokio::test]
    async fn test_graceful_cancel_leaves_teardown_to_worker() {
        let source = ScriptedSource::new();
        let node = running_leaf(&source).await;
        let (worker, device) = test_worker("cpu0");
        let job = job(&node, template(1, 60));
        job.register();
        job.set_worker(&worker);

        job.cancel(true);
        assert!(job.is_canceled());
        assert!(!job.is_destroyed());
        assert_eq!(device.canceled(), vec![(job.id(), true)]);

        job.destroy();
        assert_eq!(node.job_blockchain().unwrap().job_count(), 0);
    }
}
