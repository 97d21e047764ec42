//! Crate-level error type.
//!
//! Each subsystem owns its own error enum; this type wraps them for callers
//! that cross subsystem boundaries (the scheduler facade and the daemon).

use thiserror::Error;

use crate::config::ConfigError;
use crate::job::JobError;
use crate::persist::StateError;
use crate::work_source::{SourceError, TreeError};
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("No such entity")]
    UnknownEntity,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
