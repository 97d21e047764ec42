//! Core types for hashfeed.
//!
//! Re-exports the rust-bitcoin types the scheduler works with and defines the
//! few hashing quantities shared across modules.

pub use bitcoin::block::Header as BlockHeader;
pub use bitcoin::{BlockHash, Target};

use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};

/// Number of hashes in one job: the full 32-bit nonce range.
pub const NONCE_SPACE: u64 = 1 << 32;

/// Length of a serialized block header.
pub const HEADER_LEN: usize = 80;

/// Convert a hash count to megahashes.
pub fn mhashes(hashes: u64) -> f64 {
    hashes as f64 / 1_000_000.0
}

/// Megahashes in one job.
pub fn job_mhashes() -> f64 {
    mhashes(NONCE_SPACE)
}

/// Difficulty achieved by a block hash, relative to difficulty 1.
///
/// A hash of all zeroes yields infinity.
pub fn hash_difficulty(hash: &BlockHash) -> f64 {
    Target::from_le_bytes(hash.to_byte_array()).difficulty_float()
}

/// Difficulty of a share target, relative to difficulty 1.
pub fn target_difficulty(target: &Target) -> f64 {
    target.difficulty_float()
}

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Create from megahashes per second
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    /// Create from gigahashes per second
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Jobs (full nonce ranges) this rate exhausts per second.
    pub fn jobs_per_second(&self) -> f64 {
        self.0 as f64 / NONCE_SPACE as f64
    }

    /// Format with the largest unit that keeps the value above one.
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000_000 {
            format!("{:.2} TH/s", self.0 as f64 / 1e12)
        } else if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0 as f64
    }
}
