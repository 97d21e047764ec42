//! Registry of live entities.
//!
//! Blockchains, work sources and workers are owned by `Arc`s throughout the
//! scheduler; the registry hands out stable [`EntityId`]s for them so that
//! callers outside the crate can refer to an entity without holding it.

use std::sync::{Arc, Mutex, RwLock};

use slotmap::SlotMap;

use crate::blockchain::Blockchain;
use crate::work_source::WorkSourceNode;
use crate::worker::Worker;

slotmap::new_key_type! {
    /// Stable handle for a registered entity.
    pub struct EntityId;
}

/// The id an entity was registered under, if any.
#[derive(Debug, Default)]
pub struct Handle(Mutex<Option<EntityId>>);

impl Handle {
    pub fn get(&self) -> Option<EntityId> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, id: Option<EntityId>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }
}

#[derive(Clone)]
pub enum Entity {
    Blockchain(Arc<Blockchain>),
    WorkSource(Arc<WorkSourceNode>),
    Worker(Arc<Worker>),
}

impl Entity {
    fn handle(&self) -> &Handle {
        match self {
            Entity::Blockchain(b) => b.handle(),
            Entity::WorkSource(s) => s.handle(),
            Entity::Worker(w) => w.handle(),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    entities: RwLock<SlotMap<EntityId, Entity>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity, returning its existing id if already registered.
    pub fn register(&self, entity: Entity) -> EntityId {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = entity.handle().get() {
            if entities.contains_key(id) {
                return id;
            }
        }
        let id = entities.insert(entity.clone());
        entity.handle().set(Some(id));
        id
    }

    pub fn unregister(&self, id: EntityId) -> Option<Entity> {
        let removed = self
            .entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(entity) = &removed {
            entity.handle().set(None);
        }
        removed
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn blockchain(&self, id: EntityId) -> Option<Arc<Blockchain>> {
        match self.get(id)? {
            Entity::Blockchain(b) => Some(b),
            _ => None,
        }
    }

    pub fn work_source(&self, id: EntityId) -> Option<Arc<WorkSourceNode>> {
        match self.get(id)? {
            Entity::WorkSource(s) => Some(s),
            _ => None,
        }
    }

    pub fn worker(&self, id: EntityId) -> Option<Arc<Worker>> {
        match self.get(id)? {
            Entity::Worker(w) => Some(w),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
