//! The scheduler facade.
//!
//! Owns every long-lived part: the entity registry, the blockchains, the
//! work-source tree, the work queue, the fetcher and the set of workers.
//! Devices talk to the queue directly; everything else (tree edits,
//! settings, statistics, persistence) goes through here so that the
//! registry and the queue stay consistent with the tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use crate::blockchain::{Blockchain, BlockchainSettings, BlockchainStatistics};
use crate::config::{ConfigError, Configurable, SchedulerConfig};
use crate::fetcher::{Fetcher, SpeedSignal};
use crate::lifecycle::Startable;
use crate::persist::{self, InstanceState, SourceFactory, StateError, INSTANCE_VERSION};
use crate::registry::{Entity, EntityId, Registry};
use crate::statistics::{Statistics, StatisticsSource};
use crate::tracing::prelude::*;
use crate::work_queue::WorkQueue;
use crate::work_source::{SourceSettings, WorkSourceNode};
use crate::worker::{Worker, WorkerSet};
use crate::{Error, Result};

/// Queue and fetcher figures.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub depth: usize,
    pub pending: usize,
    pub taken: usize,
    pub target: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub root: Option<Statistics>,
    pub workers: Vec<Statistics>,
    pub blockchains: Vec<BlockchainStatistics>,
    pub queue: QueueStatistics,
}

pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    registry: Registry,
    blockchains: RwLock<Vec<Arc<Blockchain>>>,
    root: RwLock<Option<Arc<WorkSourceNode>>>,
    queue: Arc<WorkQueue>,
    fetcher: Arc<Fetcher>,
    workers: Arc<WorkerSet>,
    speed: Arc<SpeedSignal>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let queue = WorkQueue::new(config.clone());
        let workers = Arc::new(WorkerSet::new());
        let speed = Arc::new(SpeedSignal::new());
        let fetcher = Fetcher::new(config.clone(), queue.clone(), workers.clone(), speed.clone());
        Ok(Self {
            config,
            registry: Registry::new(),
            blockchains: RwLock::new(Vec::new()),
            root: RwLock::new(None),
            queue,
            fetcher,
            workers,
            speed,
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<SchedulerConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Handed to workers so their speed changes reach the fetcher.
    pub fn speed_signal(&self) -> &Arc<SpeedSignal> {
        &self.speed
    }

    // ---- blockchains ----

    pub fn blockchains(&self) -> Vec<Arc<Blockchain>> {
        self.blockchains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn blockchain_by_name(&self, name: &str) -> Option<Arc<Blockchain>> {
        self.blockchains().into_iter().find(|b| b.name() == name)
    }

    /// Add a shared blockchain. Names identify blockchains in saved state,
    /// so they must be unique.
    pub fn add_blockchain(&self, settings: BlockchainSettings) -> Result<Arc<Blockchain>> {
        settings.validate()?;
        let mut blockchains = self.blockchains.write().unwrap_or_else(|e| e.into_inner());
        if blockchains.iter().any(|b| b.name() == settings.name) {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: format!("blockchain {:?} already exists", settings.name),
            }
            .into());
        }
        let blockchain = Blockchain::new(settings);
        self.registry.register(Entity::Blockchain(blockchain.clone()));
        blockchains.push(blockchain.clone());
        info!(blockchain = %blockchain.name(), "Blockchain added");
        Ok(blockchain)
    }

    // ---- work sources ----

    pub fn root(&self) -> Option<Arc<WorkSourceNode>> {
        self.root.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the whole work-source tree.
    pub async fn set_root(&self, root: Option<Arc<WorkSourceNode>>) -> Result<()> {
        let old = std::mem::replace(
            &mut *self.root.write().unwrap_or_else(|e| e.into_inner()),
            root.clone(),
        );
        self.fetcher.set_root(root.clone());

        if let Some(old) = old {
            old.stop().await;
            self.queue.flush_all_of_work_source(&old);
            self.unregister_subtree(&old);
        }
        if let Some(root) = root {
            self.register_subtree(&root);
            if self.is_running() {
                root.start().await?;
            }
            info!(root = %root.name(), sources = root.subtree().len(), "Work source tree installed");
        }
        Ok(())
    }

    /// Add (or move) `child` under the group `parent`.
    pub async fn add_work_source(
        &self,
        parent: &Arc<WorkSourceNode>,
        child: Arc<WorkSourceNode>,
    ) -> Result<EntityId> {
        parent.add_child(child.clone()).await?;
        self.register_subtree(&child);
        info!(group = %parent.name(), source = %child.name(), "Work source added");
        child.id().ok_or(Error::UnknownEntity)
    }

    /// Detach `node` from the tree, stop it and drop its queued work.
    pub async fn remove_work_source(&self, node: &Arc<WorkSourceNode>) -> Result<()> {
        let Some(parent) = node.parent() else {
            return Err(Error::Other(format!(
                "{} is the root work source",
                node.name()
            )));
        };
        parent.remove_child(node).await;
        self.queue.flush_all_of_work_source(node);
        self.unregister_subtree(node);
        info!(group = %parent.name(), source = %node.name(), "Work source removed");
        Ok(())
    }

    /// Validate and apply new settings. Disabling a source flushes its work.
    pub fn apply_source_settings(
        &self,
        node: &Arc<WorkSourceNode>,
        settings: SourceSettings,
    ) -> Result<()> {
        let was_enabled = node.is_enabled();
        node.apply_settings(settings)?;
        if was_enabled && !node.is_enabled() {
            info!(source = %node.name(), "Work source disabled");
            self.queue.flush_all_of_work_source(node);
        }
        Ok(())
    }

    pub fn work_source(&self, id: EntityId) -> Option<Arc<WorkSourceNode>> {
        self.registry.work_source(id)
    }

    fn register_subtree(&self, node: &Arc<WorkSourceNode>) {
        for n in node.subtree() {
            self.registry.register(Entity::WorkSource(n.clone()));
            if let Some(blockchain) = n.blockchain() {
                self.registry.register(Entity::Blockchain(blockchain));
            }
        }
    }

    fn unregister_subtree(&self, node: &Arc<WorkSourceNode>) {
        for n in node.subtree() {
            if let Some(id) = n.id() {
                self.registry.unregister(id);
            }
        }
    }

    // ---- workers ----

    pub fn add_worker(&self, worker: Arc<Worker>) -> EntityId {
        let id = self.registry.register(Entity::Worker(worker.clone()));
        self.workers.add(worker);
        self.speed.raise();
        id
    }

    pub fn remove_worker(&self, worker: &Arc<Worker>) -> bool {
        if let Some(id) = worker.id() {
            self.registry.unregister(id);
        }
        let removed = self.workers.remove(worker);
        if removed {
            info!(worker = %worker.name(), "Worker removed");
            self.speed.raise();
        }
        removed
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.list()
    }

    // ---- statistics ----

    pub fn get_statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            root: self.root().map(|root| root.get_statistics()),
            workers: self.workers().iter().map(|w| w.get_statistics()).collect(),
            blockchains: self
                .blockchains()
                .iter()
                .map(|b| b.get_statistics())
                .collect(),
            queue: QueueStatistics {
                depth: self.queue.depth(),
                pending: self.queue.pending_count(),
                taken: self.queue.taken_count(),
                target: self.fetcher.queue_target(),
                in_flight: self.fetcher.in_flight(),
            },
        }
    }

    // ---- persistence ----

    pub fn deflate(&self) -> InstanceState {
        InstanceState {
            version: INSTANCE_VERSION,
            blockchains: self
                .blockchains()
                .iter()
                .map(|b| persist::deflate_blockchain(b))
                .collect(),
            root: self.root().map(|root| persist::deflate_source(&root)),
        }
    }

    /// Replace blockchains and the work-source tree with saved ones.
    ///
    /// Nothing changes if the state does not inflate cleanly.
    pub async fn inflate(&self, state: &InstanceState, factory: &dyn SourceFactory) -> Result<()> {
        let blockchains = state
            .blockchains
            .iter()
            .map(persist::inflate_blockchain)
            .collect::<std::result::Result<Vec<_>, StateError>>()?;
        let root = state
            .root
            .as_ref()
            .map(|root| persist::inflate_source(root, &blockchains, factory, &self.config))
            .transpose()?;

        let old = std::mem::replace(
            &mut *self.blockchains.write().unwrap_or_else(|e| e.into_inner()),
            blockchains.clone(),
        );
        for blockchain in old {
            if let Some(id) = blockchain.id() {
                self.registry.unregister(id);
            }
        }
        for blockchain in &blockchains {
            self.registry.register(Entity::Blockchain(blockchain.clone()));
        }

        self.set_root(root).await
    }
}

#[async_trait]
impl Startable for Scheduler {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.queue.start().await?;
        if let Some(root) = self.root() {
            root.start().await?;
        }
        self.fetcher.start().await?;
        info!("Scheduler started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.fetcher.stop().await;
        if let Some(root) = self.root() {
            root.stop().await;
        }
        self.queue.stop().await;
        info!("Scheduler stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
