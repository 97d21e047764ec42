//! The work source tree.
//!
//! Leaves wrap a [`JobSource`] adapter (a pool connection, a solo node, the
//! synthetic [`dummy`] source). Groups own an ordered list of children and
//! decide which child to ask next using the proportional-share rules in
//! [`bias`]. The fetcher only ever talks to the root.
//!
//! Hash accounting (pending and deferred work, score) flows
//! from a leaf up through every ancestor so that groups compete fairly in
//! their own parent. Counters shown in statistics stay on the node that
//! produced them and are summed child-first at snapshot time.

pub mod bias;
pub mod dummy;
pub mod settings;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::time::Instant;

use crate::blockchain::Blockchain;
use crate::config::{ConfigError, Configurable, SchedulerConfig};
use crate::job::{Job, JobError, JobTemplate};
use crate::lifecycle::Startable;
use crate::registry::{EntityId, Handle};
use crate::statistics::{Counters, EntityKind, Statistics, StatisticsSource};
use crate::tracing::prelude::*;
use crate::types::HEADER_LEN;

use bias::BiasState;
pub use settings::{ErrorPolicy, SourceSettings, DEFAULT_GROUP_NAME, DEFAULT_SOURCE_NAME};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Source is not running")]
    NotRunning,

    #[error("{0} is a group and cannot accept shares")]
    NotALeaf(String),

    #[error(transparent)]
    Job(#[from] JobError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("Cannot move work source {0} into itself or one of its descendants")]
    Cycle(String),

    #[error("{0} is not a work source group")]
    NotAGroup(String),

    #[error("{0} is a work source group")]
    NotALeaf(String),
}

/// A share on its way to the source that issued the job.
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    /// The source's own id for the job, if it gave one.
    pub source_job_id: Option<String>,
    /// Header with the winning nonce filled in.
    pub header: [u8; HEADER_LEN],
    pub nonce: u32,
    /// Difficulty the share actually achieved.
    pub difficulty: f64,
}

/// A source's answer to a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareVerdict {
    Accepted,
    /// Rejected, with the source's reason if it gave one.
    Rejected(Option<String>),
}

impl ShareVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ShareVerdict::Accepted)
    }

    /// Rejection reason for display.
    pub fn reason(&self) -> &str {
        match self {
            ShareVerdict::Accepted => "accepted",
            ShareVerdict::Rejected(Some(reason)) if !reason.is_empty() => reason,
            ShareVerdict::Rejected(_) => "Unknown reason",
        }
    }
}

/// Adapter behind a leaf work source.
///
/// Adapters only speak their wire protocol. Accounting, backoff and
/// scheduling are handled by the tree node wrapping them.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Class name used to recreate the adapter from saved state.
    fn class(&self) -> &'static str;

    /// Parameters saved alongside the class name.
    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn start(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Fetch zero or more jobs.
    async fn fetch(&self) -> Result<Vec<JobTemplate>, SourceError>;

    /// Submit a share. Transport failures are `Err` and will be retried.
    async fn submit(&self, share: &ShareSubmission) -> Result<ShareVerdict, SourceError>;
}

/// Per-request context handed down the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchContext {
    /// Seconds of work buffered ahead in the queue at current speed.
    pub queue_delay_secs: f64,
}

enum NodeKind {
    Group {
        children: RwLock<Vec<Arc<WorkSourceNode>>>,
    },
    Leaf {
        adapter: Arc<dyn JobSource>,
        blockchain: RwLock<Arc<Blockchain>>,
    },
}

#[derive(Default)]
struct SourceState {
    bias: BiasState,
    counters: Counters,
    difficulty: f64,
}

pub struct WorkSourceNode {
    me: Weak<WorkSourceNode>,
    handle: Handle,
    config: Arc<SchedulerConfig>,
    settings: RwLock<SourceSettings>,
    parent: Mutex<Weak<WorkSourceNode>>,
    kind: NodeKind,
    state: Mutex<SourceState>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for WorkSourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkSourceNode")
            .field("name", &self.name())
            .field("group", &self.is_group())
            .finish()
    }
}

impl WorkSourceNode {
    pub fn group(settings: SourceSettings, config: Arc<SchedulerConfig>) -> Arc<Self> {
        let kind = NodeKind::Group {
            children: RwLock::new(Vec::new()),
        };
        Self::build(settings, kind, config)
    }

    /// A leaf around `adapter`. Without a blockchain the leaf gets a private
    /// detached one.
    pub fn leaf(
        settings: SourceSettings,
        adapter: Arc<dyn JobSource>,
        blockchain: Option<Arc<Blockchain>>,
        config: Arc<SchedulerConfig>,
    ) -> Arc<Self> {
        let blockchain = blockchain.unwrap_or_else(|| Blockchain::detached(&settings.name));
        let kind = NodeKind::Leaf {
            adapter,
            blockchain: RwLock::new(blockchain),
        };
        Self::build(settings, kind, config)
    }

    fn build(settings: SourceSettings, kind: NodeKind, config: Arc<SchedulerConfig>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            handle: Handle::default(),
            config,
            settings: RwLock::new(settings),
            parent: Mutex::new(Weak::new()),
            kind,
            state: Mutex::new(SourceState::default()),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn id(&self) -> Option<EntityId> {
        self.handle.get()
    }

    pub fn name(&self) -> String {
        self.read_settings().name.clone()
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group { .. })
    }

    pub fn is_enabled(&self) -> bool {
        self.read_settings().enabled
    }

    pub(crate) fn config(&self) -> &Arc<SchedulerConfig> {
        &self.config
    }

    fn read_settings(&self) -> std::sync::RwLockReadGuard<'_, SourceSettings> {
        self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn adapter(&self) -> Option<&Arc<dyn JobSource>> {
        match &self.kind {
            NodeKind::Leaf { adapter, .. } => Some(adapter),
            NodeKind::Group { .. } => None,
        }
    }

    // ---- tree ----

    pub fn parent(&self) -> Option<Arc<WorkSourceNode>> {
        self.parent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    fn set_parent(&self, parent: Weak<WorkSourceNode>) {
        *self.parent.lock().unwrap_or_else(|e| e.into_inner()) = parent;
    }

    /// Children in order. Empty for leaves.
    pub fn children(&self) -> Vec<Arc<WorkSourceNode>> {
        match &self.kind {
            NodeKind::Group { children } => children
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            NodeKind::Leaf { .. } => Vec::new(),
        }
    }

    /// This node and everything below it, parents before children.
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<WorkSourceNode>> {
        let mut nodes = vec![self.clone()];
        let mut index = 0;
        while index < nodes.len() {
            let children = nodes[index].children();
            nodes.extend(children);
            index += 1;
        }
        nodes
    }

    /// This node followed by its ancestors up to the root.
    fn lineage(&self) -> Vec<Arc<WorkSourceNode>> {
        let mut nodes = Vec::new();
        let mut cursor = self.me.upgrade();
        while let Some(node) = cursor {
            cursor = node.parent();
            nodes.push(node);
        }
        nodes
    }

    fn for_lineage(&self, mut f: impl FnMut(&mut SourceState)) {
        for node in self.lineage() {
            f(&mut node.lock());
        }
    }

    /// Link `child` under this group without starting or stopping it.
    pub(crate) fn attach(&self, child: Arc<WorkSourceNode>) -> Result<(), TreeError> {
        let NodeKind::Group { children } = &self.kind else {
            return Err(TreeError::NotAGroup(self.name()));
        };

        if self.lineage().iter().any(|node| Arc::ptr_eq(node, &child)) {
            return Err(TreeError::Cycle(child.name()));
        }

        if let Some(old) = child.parent() {
            if std::ptr::eq(Arc::as_ptr(&old), self) {
                return Ok(());
            }
            old.detach(&child);
        }

        child.set_parent(self.me.clone());
        children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
        Ok(())
    }

    pub(crate) fn detach(&self, child: &Arc<WorkSourceNode>) -> bool {
        let NodeKind::Group { children } = &self.kind else {
            return false;
        };
        let mut children = children.write().unwrap_or_else(|e| e.into_inner());
        let before = children.len();
        children.retain(|c| !Arc::ptr_eq(c, child));
        let removed = children.len() != before;
        drop(children);

        if removed {
            child.set_parent(Weak::new());
        }
        removed
    }

    /// Add (or move) `child` under this group. The child ends up running
    /// exactly when this group is.
    pub async fn add_child(&self, child: Arc<WorkSourceNode>) -> Result<(), TreeError> {
        self.attach(child.clone())?;

        if self.is_running() {
            debug!(group = %self.name(), source = %child.name(), "Starting work source");
            if let Err(e) = child.start().await {
                warn!(
                    group = %self.name(),
                    source = %child.name(),
                    error = %e,
                    "Could not start work source"
                );
            }
        } else if child.is_running() {
            child.stop().await;
        }
        Ok(())
    }

    /// Remove `child` from this group, stopping it. Returns whether it was a
    /// child.
    pub async fn remove_child(&self, child: &Arc<WorkSourceNode>) -> bool {
        let removed = self.detach(child);
        if removed && child.is_running() {
            debug!(group = %self.name(), source = %child.name(), "Stopping work source");
            child.stop().await;
        }
        removed
    }

    // ---- blockchain ----

    /// The shared blockchain this leaf belongs to. `None` for groups and for
    /// leaves on a private detached blockchain.
    pub fn blockchain(&self) -> Option<Arc<Blockchain>> {
        self.job_blockchain().filter(|b| !b.is_detached())
    }

    /// The blockchain new jobs from this leaf are checked against.
    pub(crate) fn job_blockchain(&self) -> Option<Arc<Blockchain>> {
        match &self.kind {
            NodeKind::Leaf { blockchain, .. } => {
                Some(blockchain.read().unwrap_or_else(|e| e.into_inner()).clone())
            }
            NodeKind::Group { .. } => None,
        }
    }

    pub fn set_blockchain(&self, new: Option<Arc<Blockchain>>) -> Result<(), TreeError> {
        let NodeKind::Leaf { blockchain, .. } = &self.kind else {
            return Err(TreeError::NotALeaf(self.name()));
        };
        let new = new.unwrap_or_else(|| Blockchain::detached(&self.name()));
        *blockchain.write().unwrap_or_else(|e| e.into_inner()) = new;
        Ok(())
    }

    // ---- accounting ----

    pub(crate) fn add_pending_mhashes(&self, mh: f64) {
        self.for_lineage(|s| s.bias.pending_mhashes += mh);
    }

    pub(crate) fn add_deferred_mhashes(&self, mh: f64) {
        self.for_lineage(|s| s.bias.deferred_mhashes += mh);
    }

    pub(crate) fn add_processed(&self, hashes: u64) {
        self.lock().counters.hashes += hashes;
    }

    pub(crate) fn adjust_score(&self, delta: f64) {
        if delta != 0.0 {
            self.for_lineage(|s| s.bias.score += delta);
        }
    }

    pub(crate) fn record_job_accepted(&self) {
        self.lock().counters.jobs_accepted += 1;
        self.adjust_score(self.config.bias.job_start);
    }

    pub(crate) fn record_job_finished(&self) {
        self.adjust_score(self.config.bias.job_finish);
    }

    pub(crate) fn record_job_canceled(&self) {
        self.lock().counters.jobs_canceled += 1;
    }

    pub(crate) fn record_upload_retry(&self) {
        self.lock().counters.upload_retries += 1;
        self.adjust_score(self.config.bias.upload_retry);
    }

    /// Book a share verdict. `difficulty` is the job's difficulty.
    pub(crate) fn record_share(&self, verdict: &ShareVerdict, difficulty: f64) {
        let bias = &self.config.bias;
        if verdict.is_accepted() {
            self.lock().counters.shares_accepted += 1;
            self.adjust_score(bias.share * difficulty);
        } else {
            let lockout = self.read_settings().errors.stale_lockout();
            {
                let mut state = self.lock();
                state.counters.shares_rejected += 1;
                state.bias.lock_out_until(Instant::now() + lockout);
            }
            self.adjust_score(bias.stale * difficulty);
        }
    }

    fn handle_fetch_success(&self) {
        self.lock().bias.sequential_errors = 0;
    }

    fn handle_fetch_error(&self) {
        let policy = self.read_settings().errors.clone();
        {
            let mut state = self.lock();
            state.counters.failed_job_requests += 1;
            state.bias.sequential_errors += 1;
            let lockout = policy.lockout_after(state.bias.sequential_errors);
            state.bias.lock_out_until(Instant::now() + lockout);
        }
        self.adjust_score(self.config.bias.fetch_failure);
    }

    pub fn score(&self) -> f64 {
        self.lock().bias.score
    }

    pub fn is_locked_out(&self) -> bool {
        self.lock().bias.is_locked_out(Instant::now())
    }

    pub(crate) fn bias_snapshot(&self) -> BiasState {
        self.lock().bias.clone()
    }

    /// Where this node stands in its parent's selection, or `None` if it
    /// cannot be asked right now.
    fn selection_metric(&self, now: Instant, ctx: &FetchContext) -> Option<f64> {
        if !self.is_running() {
            return None;
        }
        let (enabled, priority, guaranteed) = {
            let s = self.read_settings();
            (s.enabled, s.priority, s.hashrate_mhps)
        };
        if !enabled {
            return None;
        }

        let state = self.lock();
        if state.bias.is_locked_out(now) {
            return None;
        }
        let uptime = state.counters.uptime_secs();
        let estimate = state
            .bias
            .estimate(uptime, ctx.queue_delay_secs, guaranteed);
        Some(bias::metric(estimate, state.bias.score, priority))
    }

    // ---- work ----

    /// Ask this subtree for work. Resolves to an empty batch when nothing
    /// is available; errors are only returned by leaves.
    pub fn get_job<'a>(
        self: &'a Arc<Self>,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Vec<Arc<Job>>, SourceError>> {
        async move {
            if !self.is_running() || !self.is_enabled() {
                return Ok(Vec::new());
            }
            match &self.kind {
                NodeKind::Group { .. } => self.get_job_from_children(ctx).await,
                NodeKind::Leaf { adapter, .. } => self.fetch_from_adapter(adapter, ctx).await,
            }
        }
        .boxed()
    }

    async fn get_job_from_children(
        self: &Arc<Self>,
        ctx: &FetchContext,
    ) -> Result<Vec<Arc<Job>>, SourceError> {
        let children = self.children();
        for child in &children {
            child.lock().bias.decay_round(&self.config.bias);
        }

        let now = Instant::now();
        let mut metrics: Vec<Option<f64>> = children
            .iter()
            .map(|child| child.selection_metric(now, ctx))
            .collect();

        while let Some(index) = bias::select(&metrics) {
            metrics[index] = None;
            let child = &children[index];
            child.lock().bias.score += self.config.bias.request;

            match child.get_job(ctx).await {
                Ok(jobs) if !jobs.is_empty() => return Ok(jobs),
                Ok(_) => trace!(group = %self.name(), source = %child.name(), "No work"),
                Err(e) => debug!(
                    group = %self.name(),
                    source = %child.name(),
                    error = %e,
                    "Trying next work source"
                ),
            }
        }
        Ok(Vec::new())
    }

    async fn fetch_from_adapter(
        self: &Arc<Self>,
        adapter: &Arc<dyn JobSource>,
        _ctx: &FetchContext,
    ) -> Result<Vec<Arc<Job>>, SourceError> {
        {
            let mut state = self.lock();
            if state.bias.is_locked_out(Instant::now()) {
                return Ok(Vec::new());
            }
            state.counters.job_requests += 1;
        }

        let templates = match adapter.fetch().await {
            Ok(templates) => templates,
            Err(e) => {
                warn!(source = %self.name(), error = %e, "Error while fetching job");
                self.handle_fetch_error();
                return Err(e);
            }
        };
        self.handle_fetch_success();

        let Some(blockchain) = self.job_blockchain() else {
            return Ok(Vec::new());
        };

        let mut jobs = Vec::with_capacity(templates.len());
        for template in templates {
            match Job::new(self.clone(), blockchain.clone(), template) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(source = %self.name(), error = %e, "Discarding malformed job"),
            }
        }

        if let Some(job) = jobs.last() {
            self.lock().difficulty = job.difficulty();
        }
        trace!(source = %self.name(), jobs = jobs.len(), "Fetched jobs");
        Ok(jobs)
    }

    /// Hand a share to this leaf's adapter.
    pub async fn submit(&self, share: &ShareSubmission) -> Result<ShareVerdict, SourceError> {
        let Some(adapter) = self.adapter() else {
            return Err(SourceError::NotALeaf(self.name()));
        };
        if !self.is_running() {
            return Err(SourceError::NotRunning);
        }
        adapter.submit(share).await
    }
}

#[async_trait]
impl Startable for WorkSourceNode {
    async fn start(&self) -> crate::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        {
            let mut state = self.lock();
            state.counters.restart();
            state.bias.reset_errors();
        }

        match &self.kind {
            NodeKind::Leaf { adapter, .. } => adapter.start().await?,
            NodeKind::Group { .. } => {
                for child in self.children() {
                    if let Err(e) = child.start().await {
                        warn!(
                            group = %self.name(),
                            source = %child.name(),
                            error = %e,
                            "Could not start work source"
                        );
                    }
                }
            }
        }

        self.running.store(true, Ordering::Release);
        debug!(source = %self.name(), "Work source started");
        Ok(())
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        match &self.kind {
            NodeKind::Leaf { adapter, .. } => adapter.stop().await,
            NodeKind::Group { .. } => {
                for child in self.children() {
                    child.stop().await;
                }
            }
        }
        debug!(source = %self.name(), "Work source stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Configurable for WorkSourceNode {
    type Settings = SourceSettings;

    fn settings(&self) -> SourceSettings {
        self.read_settings().clone()
    }

    fn apply_settings(&self, settings: SourceSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }
}

impl StatisticsSource for WorkSourceNode {
    type Snapshot = Statistics;

    fn get_statistics(&self) -> Statistics {
        let kind = if self.is_group() {
            EntityKind::WorkSourceGroup
        } else {
            EntityKind::WorkSource
        };
        let mut stats = Statistics::new(kind, self.name());
        stats.id = self.id();
        {
            let state = self.lock();
            state.counters.fill(&mut stats);
            stats.difficulty = state.difficulty;
            stats.score = state.bias.score;
        }

        let children: Vec<Statistics> = self
            .children()
            .iter()
            .map(|child| child.get_statistics())
            .collect();
        if !children.is_empty() {
            stats.difficulty = children
                .iter()
                .map(|c| c.difficulty)
                .fold(stats.difficulty, f64::max);
            stats.add_children(children);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{template, ScriptedSource};
    use super::*;
    use crate::types::job_mhashes;
    use std::time::Duration;

    fn config() -> Arc<SchedulerConfig> {
        Arc::new(SchedulerConfig::default())
    }

    fn leaf(name: &str, source: &Arc<ScriptedSource>) -> Arc<WorkSourceNode> {
        WorkSourceNode::leaf(
            SourceSettings::named(name),
            source.clone(),
            None,
            config(),
        )
    }

    fn group(name: &str) -> Arc<WorkSourceNode> {
        WorkSourceNode::group(SourceSettings::named(name), config())
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let root = group("root");
        let inner = group("inner");
        root.add_child(inner.clone()).await.unwrap();

        assert_eq!(
            inner.add_child(root.clone()).await,
            Err(TreeError::Cycle("root".into()))
        );
        assert_eq!(
            inner.add_child(inner.clone()).await,
            Err(TreeError::Cycle("inner".into()))
        );
    }

    #[tokio::test]
    async fn test_move_reparents() {
        let root = group("root");
        let a = group("a");
        let b = group("b");
        let source = ScriptedSource::new();
        let pool = leaf("pool", &source);

        root.add_child(a.clone()).await.unwrap();
        root.add_child(b.clone()).await.unwrap();
        a.add_child(pool.clone()).await.unwrap();
        b.add_child(pool.clone()).await.unwrap();

        assert!(a.children().is_empty());
        assert_eq!(b.children().len(), 1);
        assert!(Arc::ptr_eq(&pool.parent().unwrap(), &b));
        assert_eq!(root.subtree().len(), 4);
    }

    #[tokio::test]
    async fn test_leaf_cannot_have_children() {
        let source = ScriptedSource::new();
        let pool = leaf("pool", &source);
        let other = group("g");
        assert_eq!(
            pool.add_child(other).await,
            Err(TreeError::NotAGroup("pool".into()))
        );
    }

    #[tokio::test]
    async fn test_adding_to_running_group_starts_child() {
        let root = group("root");
        root.start().await.unwrap();

        let source = ScriptedSource::new();
        let pool = leaf("pool", &source);
        root.add_child(pool.clone()).await.unwrap();
        assert!(pool.is_running());
        assert_eq!(source.starts(), 1);

        assert!(root.remove_child(&pool).await);
        assert!(!pool.is_running());
        assert!(pool.parent().is_none());
    }

    #[tokio::test]
    async fn test_stopped_source_yields_nothing() {
        let source = ScriptedSource::new();
        source.push_jobs(vec![template(1, 60)]);
        let pool = leaf("pool", &source);

        let jobs = pool.get_job(&FetchContext::default()).await.unwrap();
        assert!(jobs.is_empty());
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_locks_out_and_penalizes() {
        let source = ScriptedSource::new();
        source.push_error();
        let pool = leaf("pool", &source);
        pool.start().await.unwrap();

        let ctx = FetchContext::default();
        assert!(pool.get_job(&ctx).await.is_err());
        assert!(pool.is_locked_out());
        assert_eq!(pool.score(), -3000.0);

        // Locked out: not even asked.
        source.push_jobs(vec![template(1, 60)]);
        assert!(pool.get_job(&ctx).await.unwrap().is_empty());
        assert_eq!(source.fetches(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(pool.get_job(&ctx).await.unwrap().len(), 1);

        let stats = pool.get_statistics();
        assert_eq!(stats.job_requests, 2);
        assert_eq!(stats.failed_job_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_alternates_between_equal_children() {
        let root = group("root");
        let a_source = ScriptedSource::endless(1);
        let b_source = ScriptedSource::endless(2);
        let a = leaf("a", &a_source);
        let b = leaf("b", &b_source);
        root.add_child(a.clone()).await.unwrap();
        root.add_child(b.clone()).await.unwrap();
        root.start().await.unwrap();

        let ctx = FetchContext::default();
        for _ in 0..10 {
            let jobs = root.get_job(&ctx).await.unwrap();
            // Registering makes the work outstanding, as the queue would.
            for job in &jobs {
                job.register();
            }
        }
        assert_eq!(a_source.fetches(), 5);
        assert_eq!(b_source.fetches(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_skews_allocation() {
        let root = group("root");
        let a_source = ScriptedSource::endless(1);
        let b_source = ScriptedSource::endless(2);
        let a = leaf("a", &a_source);
        let mut settings = SourceSettings::named("b");
        settings.priority = 3.0;
        let b = WorkSourceNode::leaf(settings, b_source.clone(), None, config());
        root.add_child(a).await.unwrap();
        root.add_child(b).await.unwrap();
        root.start().await.unwrap();

        let ctx = FetchContext::default();
        for _ in 0..40 {
            for job in root.get_job(&ctx).await.unwrap() {
                job.register();
            }
        }
        // Roughly three to one; exact interleaving depends on decay.
        assert_eq!(a_source.fetches() + b_source.fetches(), 40);
        assert!((29..=31).contains(&b_source.fetches()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_falls_through_failing_child() {
        let root = group("root");
        let bad_source = ScriptedSource::new();
        bad_source.push_error();
        let good_source = ScriptedSource::endless(7);
        root.add_child(leaf("bad", &bad_source)).await.unwrap();
        root.add_child(leaf("good", &good_source)).await.unwrap();
        root.start().await.unwrap();

        let jobs = root.get_job(&FetchContext::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source().name(), "good");
        assert_eq!(bad_source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_child_skipped() {
        let root = group("root");
        let off_source = ScriptedSource::endless(1);
        let on_source = ScriptedSource::endless(2);
        let off = leaf("off", &off_source);
        let mut settings = off.settings();
        settings.enabled = false;
        off.apply_settings(settings).unwrap();
        root.add_child(off).await.unwrap();
        root.add_child(leaf("on", &on_source)).await.unwrap();
        root.start().await.unwrap();

        for _ in 0..3 {
            root.get_job(&FetchContext::default()).await.unwrap();
        }
        assert_eq!(off_source.fetches(), 0);
        assert_eq!(on_source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounting_reaches_ancestors() {
        let root = group("root");
        let source = ScriptedSource::endless(1);
        let pool = leaf("pool", &source);
        root.add_child(pool.clone()).await.unwrap();
        root.start().await.unwrap();

        let jobs = root.get_job(&FetchContext::default()).await.unwrap();
        jobs[0].register();
        let pending = root.bias_snapshot().pending_mhashes;
        assert!((pending + job_mhashes()).abs() < 1e-6);

        pool.record_share(&ShareVerdict::Accepted, 2.0);
        // Request bias stays on the child; share credit reaches the root.
        assert_eq!(pool.score(), 7999.0);
        assert_eq!(root.score(), 8000.0);

        let stats = root.get_statistics();
        assert_eq!(stats.shares_accepted, 1);
        assert_eq!(stats.children.len(), 1);
        assert_eq!(stats.children[0].jobs_accepted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_share_locks_out_leaf() {
        let source = ScriptedSource::endless(1);
        let pool = leaf("pool", &source);
        pool.start().await.unwrap();

        pool.record_share(&ShareVerdict::Rejected(None), 1.0);
        assert!(pool.is_locked_out());
        assert_eq!(pool.score(), -15000.0);
        assert_eq!(pool.get_statistics().shares_rejected, 1);

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!pool.is_locked_out());
    }

    #[test]
    fn test_verdict_reason() {
        assert_eq!(ShareVerdict::Rejected(None).reason(), "Unknown reason");
        assert_eq!(
            ShareVerdict::Rejected(Some(String::new())).reason(),
            "Unknown reason"
        );
        assert_eq!(
            ShareVerdict::Rejected(Some("stale".into())).reason(),
            "stale"
        );
    }
}
