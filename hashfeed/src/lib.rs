//! hashfeed: a work distribution scheduler for proof-of-work hashing devices.
//!
//! Jobs flow from a tree of work sources, through an expiry-ordered
//! [`work_queue::WorkQueue`] kept stocked by the [`fetcher::Fetcher`], to
//! devices. Each [`blockchain::Blockchain`] watches the previous-block hash
//! of incoming work and flushes outstanding jobs when a new block appears.
//! The [`scheduler::Scheduler`] ties these together.

pub mod blockchain;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod lifecycle;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod statistics;
pub mod tracing;
pub mod types;
pub mod work_queue;
pub mod work_source;
pub mod worker;

pub use error::{Error, Result};
