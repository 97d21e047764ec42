//! Block-change detection.
//!
//! A [`Blockchain`] remembers which previous-block hash current work builds
//! on, and which hashes were superseded recently. Every job is checked
//! against it on admission to the queue:
//!
//! - Same prevhash as current work: accepted.
//! - Prevhash superseded within the debounce window: stale, rejected.
//! - Anything else: a new block. All jobs registered with the blockchain are
//!   flushed and the job is accepted.
//!
//! The history is what keeps pools that lag behind (or switch between two
//! tips) from flushing everyone's work twice in a row. Hashes are forgotten
//! once they have been superseded for longer than the debounce window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::config::{ConfigError, Configurable};
use crate::job::Job;
use crate::registry::{EntityId, Handle};
use crate::statistics::StatisticsSource;
use crate::tracing::prelude::*;
use crate::types::BlockHash;

/// Superseded hashes remembered at most.
const HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockchainSettings {
    pub name: String,
    /// Debounce window in seconds.
    #[serde(alias = "grouptime")]
    pub debounce_secs: f64,
}

impl Default for BlockchainSettings {
    fn default() -> Self {
        Self {
            name: "Untitled blockchain".into(),
            debounce_secs: 30.0,
        }
    }
}

impl BlockchainSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if !(self.debounce_secs.is_finite() && self.debounce_secs >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "debounce_secs",
                reason: "must be a non-negative number".into(),
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }
}

/// Result of checking a job's prevhash.
#[derive(Debug)]
pub enum BlockCheck {
    Current,
    Stale,
    /// A new block. Jobs already claimed by workers must be canceled by the
    /// caller; unclaimed ones have been destroyed.
    NewBlock { to_cancel: Vec<Arc<Job>> },
}

#[derive(Default)]
struct ChainState {
    /// (hash, time it was superseded), oldest first.
    history: VecDeque<(BlockHash, Instant)>,
    debounce_until: Option<Instant>,
    jobs: HashMap<u64, Arc<Job>>,
    blocks: u64,
    last_block: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockchainStatistics {
    pub id: Option<EntityId>,
    pub name: String,
    pub blocks: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_block: Option<OffsetDateTime>,
    pub current_prevhash: Option<BlockHash>,
    pub live_jobs: usize,
}

pub struct Blockchain {
    handle: Handle,
    detached: bool,
    settings: RwLock<BlockchainSettings>,
    /// Read without taking `state` for the common case.
    current: RwLock<Option<BlockHash>>,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("name", &self.name())
            .field("current", &self.current_prevhash())
            .finish()
    }
}

impl Blockchain {
    pub fn new(settings: BlockchainSettings) -> Arc<Self> {
        Self::build(settings, false)
    }

    /// A private blockchain for a work source that is not attached to any
    /// shared one. It never appears in the registry or in saved state.
    pub fn detached(name: &str) -> Arc<Self> {
        let settings = BlockchainSettings {
            name: format!("{} (detached)", name),
            ..Default::default()
        };
        Self::build(settings, true)
    }

    fn build(settings: BlockchainSettings, detached: bool) -> Arc<Self> {
        Arc::new(Self {
            handle: Handle::default(),
            detached,
            settings: RwLock::new(settings),
            current: RwLock::new(None),
            state: Mutex::new(ChainState::default()),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn id(&self) -> Option<EntityId> {
        self.handle.get()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn name(&self) -> String {
        self.settings().name
    }

    pub fn current_prevhash(&self) -> Option<BlockHash> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify a job by its prevhash, flushing existing work on a new block.
    pub fn check_job(&self, job: &Job) -> BlockCheck {
        self.check_prevhash(job.prevhash())
    }

    pub(crate) fn check_prevhash(&self, prevhash: BlockHash) -> BlockCheck {
        if self.current_prevhash() == Some(prevhash) {
            return BlockCheck::Current;
        }

        let window = self.settings().debounce();
        let now = Instant::now();
        let flushed = {
            let mut state = self.lock();
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());

            // Another producer may have switched to this block meanwhile.
            if *current == Some(prevhash) {
                return BlockCheck::Current;
            }

            state
                .history
                .retain(|(_, superseded)| now.duration_since(*superseded) < window);
            if state.history.iter().any(|(hash, _)| *hash == prevhash) {
                debug!(
                    blockchain = %self.name(),
                    prevhash = %prevhash,
                    "Rejecting job for a superseded block"
                );
                return BlockCheck::Stale;
            }

            if state.debounce_until.map_or(true, |until| now >= until) {
                state.history.clear();
            }
            if let Some(old) = current.replace(prevhash) {
                state.history.push_back((old, now));
                while state.history.len() > HISTORY_LEN {
                    state.history.pop_front();
                }
            }
            state.debounce_until = Some(now + window);
            state.blocks += 1;
            state.last_block = Some(OffsetDateTime::now_utc());

            std::mem::take(&mut state.jobs)
        };

        info!(
            blockchain = %self.name(),
            prevhash = %prevhash,
            flushed = flushed.len(),
            "New block"
        );

        // Teardown runs without our lock: it calls back into remove_job.
        let mut to_cancel = Vec::new();
        for job in flushed.into_values() {
            if job.worker().is_some() {
                to_cancel.push(job);
            } else {
                job.destroy();
            }
        }
        BlockCheck::NewBlock { to_cancel }
    }

    pub(crate) fn add_job(&self, job: Arc<Job>) {
        self.lock().jobs.insert(job.id(), job);
    }

    pub(crate) fn remove_job(&self, job: &Job) {
        self.lock().jobs.remove(&job.id());
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

impl Configurable for Blockchain {
    type Settings = BlockchainSettings;

    fn settings(&self) -> BlockchainSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn apply_settings(&self, settings: BlockchainSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }
}

impl StatisticsSource for Blockchain {
    type Snapshot = BlockchainStatistics;

    fn get_statistics(&self) -> BlockchainStatistics {
        let name = self.name();
        let current_prevhash = self.current_prevhash();
        let state = self.lock();
        BlockchainStatistics {
            id: self.id(),
            name,
            blocks: state.blocks,
            last_block: state.last_block,
            current_prevhash,
            live_jobs: state.jobs.len(),
        }
    }
}
