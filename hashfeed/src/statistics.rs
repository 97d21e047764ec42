//! Statistics snapshots.
//!
//! Work sources and workers keep a [`Counters`] block behind their own lock
//! and produce [`Statistics`] snapshots on demand. Group snapshots are built
//! child-first: each child is snapshotted under its own lock, then the group
//! sums the results, so no two entity locks are ever held together.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::registry::EntityId;
use crate::types::mhashes;

/// Anything that can report a statistics snapshot.
pub trait StatisticsSource {
    type Snapshot;

    fn get_statistics(&self) -> Self::Snapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    WorkSourceGroup,
    WorkSource,
    Worker,
}

/// Mining counters for a work source, group or worker.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub id: Option<EntityId>,
    pub kind: EntityKind,
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    pub ghashes: f64,
    /// Average since start.
    pub avg_mhps: f64,
    /// Current estimate, from the worker's reported speed.
    pub mhps: f64,
    pub job_requests: u64,
    pub failed_job_requests: u64,
    pub upload_retries: u64,
    pub jobs_accepted: u64,
    pub jobs_canceled: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_invalid: u64,
    pub shares_below_target: u64,
    pub difficulty: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Statistics>,
}

impl Statistics {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            name: name.into(),
            start_time: None,
            ghashes: 0.0,
            avg_mhps: 0.0,
            mhps: 0.0,
            job_requests: 0,
            failed_job_requests: 0,
            upload_retries: 0,
            jobs_accepted: 0,
            jobs_canceled: 0,
            shares_accepted: 0,
            shares_rejected: 0,
            shares_invalid: 0,
            shares_below_target: 0,
            difficulty: 0.0,
            score: 0.0,
            children: Vec::new(),
        }
    }

    /// Fold child snapshots into this one and attach them.
    pub fn add_children(&mut self, children: Vec<Statistics>) {
        for child in &children {
            self.ghashes += child.ghashes;
            self.avg_mhps += child.avg_mhps;
            self.mhps += child.mhps;
            self.job_requests += child.job_requests;
            self.failed_job_requests += child.failed_job_requests;
            self.upload_retries += child.upload_retries;
            self.jobs_accepted += child.jobs_accepted;
            self.jobs_canceled += child.jobs_canceled;
            self.shares_accepted += child.shares_accepted;
            self.shares_rejected += child.shares_rejected;
            self.shares_invalid += child.shares_invalid;
            self.shares_below_target += child.shares_below_target;
        }
        self.children = children;
    }
}

/// Live counters behind an entity's lock.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    started: Option<(Instant, OffsetDateTime)>,
    pub hashes: u64,
    pub job_requests: u64,
    pub failed_job_requests: u64,
    pub upload_retries: u64,
    pub jobs_accepted: u64,
    pub jobs_canceled: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_invalid: u64,
    pub shares_below_target: u64,
}

impl Counters {
    /// Zero everything and mark the start of a new epoch.
    pub fn restart(&mut self) {
        *self = Self {
            started: Some((Instant::now(), OffsetDateTime::now_utc())),
            ..Self::default()
        };
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started
            .map(|(at, _)| at.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Copy the counters into a snapshot.
    pub fn fill(&self, stats: &mut Statistics) {
        let mh = mhashes(self.hashes);
        let uptime = self.uptime_secs();

        stats.start_time = self.started.map(|(_, wall)| wall);
        stats.ghashes = mh / 1000.0;
        stats.avg_mhps = if uptime > 0.0 { mh / uptime } else { 0.0 };
        stats.job_requests = self.job_requests;
        stats.failed_job_requests = self.failed_job_requests;
        stats.upload_retries = self.upload_retries;
        stats.jobs_accepted = self.jobs_accepted;
        stats.jobs_canceled = self.jobs_canceled;
        stats.shares_accepted = self.shares_accepted;
        stats.shares_rejected = self.shares_rejected;
        stats.shares_invalid = self.shares_invalid;
        stats.shares_below_target = self.shares_below_target;
    }
}
