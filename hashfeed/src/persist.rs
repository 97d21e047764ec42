//! Saving and restoring the scheduler's entities.
//!
//! Each entity deflates to a versioned [`EntityState`] tagged by its class;
//! the whole instance (blockchains plus the work-source tree) is one JSON
//! document. Leaf adapters are recreated from their class name and
//! parameters by a [`SourceFactory`]. Runtime state such as scores and
//! counters is not saved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::{Blockchain, BlockchainSettings};
use crate::config::{ConfigError, Configurable, SchedulerConfig};
use crate::work_source::dummy::{self, DummySource};
use crate::work_source::{JobSource, SourceSettings, TreeError, WorkSourceNode};

pub const BLOCKCHAIN_VERSION: u32 = 1;
pub const GROUP_VERSION: u32 = 1;
pub const SOURCE_VERSION: u32 = 1;
pub const INSTANCE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Malformed state: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported {class} state version {version}")]
    Version { class: &'static str, version: u32 },

    #[error("Unknown work source class {0:?}")]
    UnknownClass(String),

    #[error("Invalid parameters for {class}: {reason}")]
    Params { class: String, reason: String },

    #[error("Unknown blockchain {0:?}")]
    UnknownBlockchain(String),

    #[error("Expected {expected} state, found {found}")]
    WrongClass {
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Saved form of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum EntityState {
    Blockchain {
        version: u32,
        settings: BlockchainSettings,
    },
    WorkSourceGroup {
        version: u32,
        settings: SourceSettings,
        #[serde(default)]
        children: Vec<EntityState>,
    },
    WorkSource {
        version: u32,
        settings: SourceSettings,
        adapter: String,
        #[serde(default)]
        params: serde_json::Value,
        /// By name; `None` for a source with a detached blockchain.
        #[serde(default)]
        blockchain: Option<String>,
    },
}

impl EntityState {
    pub fn class(&self) -> &'static str {
        match self {
            EntityState::Blockchain { .. } => "blockchain",
            EntityState::WorkSourceGroup { .. } => "work_source_group",
            EntityState::WorkSource { .. } => "work_source",
        }
    }
}

/// Everything saved across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub version: u32,
    pub blockchains: Vec<EntityState>,
    pub root: Option<EntityState>,
}

impl InstanceState {
    pub fn to_blob(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_blob(blob: &str) -> Result<Self, StateError> {
        let state: Self = serde_json::from_str(blob)?;
        if state.version != INSTANCE_VERSION {
            return Err(StateError::Version {
                class: "instance",
                version: state.version,
            });
        }
        Ok(state)
    }

    /// Read a saved instance; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        match std::fs::read_to_string(path) {
            Ok(blob) => Self::from_blob(&blob).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        // Write beside and rename, so a crash never leaves half a file.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_blob()?).map_err(io)?;
        std::fs::rename(&tmp, path).map_err(io)
    }
}

/// Builds leaf adapters from saved class names and parameters.
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        class: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn JobSource>, StateError>;
}

/// Knows the adapters built into this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinSources;

impl SourceFactory for BuiltinSources {
    fn create(
        &self,
        class: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn JobSource>, StateError> {
        match class {
            dummy::CLASS => DummySource::from_params(params.clone())
                .map(|source| Arc::new(source) as Arc<dyn JobSource>)
                .map_err(|e| StateError::Params {
                    class: class.to_string(),
                    reason: e.to_string(),
                }),
            other => Err(StateError::UnknownClass(other.to_string())),
        }
    }
}

pub fn deflate_blockchain(blockchain: &Blockchain) -> EntityState {
    EntityState::Blockchain {
        version: BLOCKCHAIN_VERSION,
        settings: blockchain.settings(),
    }
}

pub fn inflate_blockchain(state: &EntityState) -> Result<Arc<Blockchain>, StateError> {
    match state {
        EntityState::Blockchain { version, settings } => {
            check_version("blockchain", *version, BLOCKCHAIN_VERSION)?;
            settings.validate()?;
            Ok(Blockchain::new(settings.clone()))
        }
        other => Err(StateError::WrongClass {
            expected: "blockchain",
            found: other.class(),
        }),
    }
}

/// Deflate a work source and everything below it.
pub fn deflate_source(node: &Arc<WorkSourceNode>) -> EntityState {
    let settings = node.settings();
    match node.adapter() {
        None => EntityState::WorkSourceGroup {
            version: GROUP_VERSION,
            settings,
            children: node.children().iter().map(deflate_source).collect(),
        },
        Some(adapter) => EntityState::WorkSource {
            version: SOURCE_VERSION,
            settings,
            adapter: adapter.class().to_string(),
            params: adapter.params(),
            blockchain: node.blockchain().map(|b| b.name()),
        },
    }
}

/// Rebuild a work-source subtree. The returned nodes are not started.
pub fn inflate_source(
    state: &EntityState,
    blockchains: &[Arc<Blockchain>],
    factory: &dyn SourceFactory,
    config: &Arc<SchedulerConfig>,
) -> Result<Arc<WorkSourceNode>, StateError> {
    match state {
        EntityState::WorkSourceGroup {
            version,
            settings,
            children,
        } => {
            check_version("work_source_group", *version, GROUP_VERSION)?;
            settings.validate()?;
            let group = WorkSourceNode::group(settings.clone(), config.clone());
            for child in children {
                let child = inflate_source(child, blockchains, factory, config)?;
                group.attach(child)?;
            }
            Ok(group)
        }
        EntityState::WorkSource {
            version,
            settings,
            adapter,
            params,
            blockchain,
        } => {
            check_version("work_source", *version, SOURCE_VERSION)?;
            settings.validate()?;
            let blockchain = match blockchain {
                Some(name) => Some(
                    blockchains
                        .iter()
                        .find(|b| b.name() == *name)
                        .cloned()
                        .ok_or_else(|| StateError::UnknownBlockchain(name.clone()))?,
                ),
                None => None,
            };
            let adapter = factory.create(adapter, params)?;
            Ok(WorkSourceNode::leaf(
                settings.clone(),
                adapter,
                blockchain,
                config.clone(),
            ))
        }
        other => Err(StateError::WrongClass {
            expected: "work source",
            found: other.class(),
        }),
    }
}

fn check_version(class: &'static str, version: u32, supported: u32) -> Result<(), StateError> {
    if version == 0 || version > supported {
        return Err(StateError::Version { class, version });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_source::dummy::DummyParams;

    fn dummy(name: &str, seed: u32, chain: Option<Arc<Blockchain>>) -> Arc<WorkSourceNode> {
        let params = DummyParams {
            seed,
            ..Default::default()
        };
        WorkSourceNode::leaf(
            SourceSettings::named(name),
            Arc::new(DummySource::new(params)),
            chain,
            Arc::new(SchedulerConfig::default()),
        )
    }

    #[test]
    fn test_tree_round_trip() {
        let config = Arc::new(SchedulerConfig::default());
        let main = Blockchain::new(BlockchainSettings {
            name: "main".into(),
            debounce_secs: 60.0,
        });

        let root = WorkSourceNode::group(SourceSettings::named("root"), config.clone());
        let pools = WorkSourceNode::group(SourceSettings::named("pools"), config.clone());
        let mut backup = SourceSettings::named("backup");
        backup.priority = 0.25;
        backup.enabled = false;
        let backup = WorkSourceNode::leaf(
            backup,
            Arc::new(DummySource::new(DummyParams::default())),
            Some(main.clone()),
            config.clone(),
        );
        pools.attach(dummy("primary", 1, Some(main.clone()))).unwrap();
        pools.attach(backup).unwrap();
        root.attach(pools).unwrap();
        root.attach(dummy("solo", 2, None)).unwrap();

        let saved = InstanceState {
            version: INSTANCE_VERSION,
            blockchains: vec![deflate_blockchain(&main)],
            root: Some(deflate_source(&root)),
        };
        let blob = saved.to_blob().unwrap();
        let loaded = InstanceState::from_blob(&blob).unwrap();
        assert_eq!(loaded, saved);

        let chains: Vec<_> = loaded
            .blockchains
            .iter()
            .map(|s| inflate_blockchain(s).unwrap())
            .collect();
        let rebuilt =
            inflate_source(loaded.root.as_ref().unwrap(), &chains, &BuiltinSources, &config)
                .unwrap();

        assert_eq!(deflate_source(&rebuilt), saved.root.clone().unwrap());
        let pools = &rebuilt.children()[0];
        let primary = &pools.children()[0];
        assert!(Arc::ptr_eq(&primary.blockchain().unwrap(), &chains[0]));
        assert!(Arc::ptr_eq(&primary.parent().unwrap(), pools));
        assert!(rebuilt.children()[1].blockchain().is_none());
    }

    #[test]
    fn test_class_tags() {
        let state = deflate_blockchain(&Blockchain::new(BlockchainSettings::default()));
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["class"], "blockchain");
        assert_eq!(value["version"], 1);

        let value = serde_json::to_value(deflate_source(&dummy("d", 0, None))).unwrap();
        assert_eq!(value["class"], "work_source");
        assert_eq!(value["adapter"], "dummy");
        assert!(value["blockchain"].is_null());
    }

    #[test]
    fn test_rejects_newer_version() {
        let blob = r#"{"class": "blockchain", "version": 7, "settings": {}}"#;
        let state: EntityState = serde_json::from_str(blob).unwrap();
        assert!(matches!(
            inflate_blockchain(&state),
            Err(StateError::Version { version: 7, .. })
        ));
    }

    #[test]
    fn test_unknown_adapter_and_blockchain() {
        let config = Arc::new(SchedulerConfig::default());
        let state = EntityState::WorkSource {
            version: 1,
            settings: SourceSettings::named("x"),
            adapter: "getwork".into(),
            params: serde_json::Value::Null,
            blockchain: None,
        };
        assert!(matches!(
            inflate_source(&state, &[], &BuiltinSources, &config),
            Err(StateError::UnknownClass(c)) if c == "getwork"
        ));

        let state = EntityState::WorkSource {
            version: 1,
            settings: SourceSettings::named("x"),
            adapter: "dummy".into(),
            params: serde_json::Value::Null,
            blockchain: Some("testnet".into()),
        };
        assert!(matches!(
            inflate_source(&state, &[], &BuiltinSources, &config),
            Err(StateError::UnknownBlockchain(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("hashfeed-missing-state.json");
        assert!(InstanceState::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("hashfeed-state-{}", std::process::id()))
            .join("state.json");
        let state = InstanceState {
            version: INSTANCE_VERSION,
            blockchains: vec![deflate_blockchain(&Blockchain::new(
                BlockchainSettings::default(),
            ))],
            root: None,
        };
        state.save(&path).unwrap();
        assert_eq!(InstanceState::load(&path).unwrap(), Some(state));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
