//! Synthetic job source for development and testing.
//!
//! Produces difficulty-1 jobs with a rolling merkle root and starts a new
//! fake block every `block_interval_secs`. Every submitted share is accepted.
//! The daemon falls back to a tree of these when no saved state exists, so
//! the whole pipeline (queue, fetcher, devices, share upload) can be
//! exercised without a pool.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

use super::{JobSource, ShareSubmission, ShareVerdict, SourceError};
use crate::job::JobTemplate;
use crate::tracing::prelude::*;
use crate::types::{BlockHash, BlockHeader, Target};

pub const CLASS: &str = "dummy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DummyParams {
    /// Seconds between fake blocks.
    pub block_interval_secs: u64,
    pub job_lifetime_secs: u64,
    pub jobs_per_fetch: usize,
    /// Distinguishes the block sequence of one dummy source from another.
    pub seed: u32,
}

impl Default for DummyParams {
    fn default() -> Self {
        Self {
            block_interval_secs: 600,
            job_lifetime_secs: 60,
            jobs_per_fetch: 1,
            seed: 0,
        }
    }
}

struct Chain {
    height: u64,
    block_started: Option<Instant>,
    prevhash: BlockHash,
    merkle_seq: u64,
}

pub struct DummySource {
    params: DummyParams,
    chain: Mutex<Chain>,
}

impl DummySource {
    pub fn new(params: DummyParams) -> Self {
        Self {
            chain: Mutex::new(Chain {
                height: 0,
                block_started: None,
                prevhash: fake_block_hash(params.seed, 0),
                merkle_seq: 0,
            }),
            params,
        }
    }

    pub fn from_params(params: serde_json::Value) -> Result<Self, serde_json::Error> {
        let params = if params.is_null() {
            DummyParams::default()
        } else {
            serde_json::from_value(params)?
        };
        Ok(Self::new(params))
    }

    fn next_header(&self) -> BlockHeader {
        let interval = Duration::from_secs(self.params.block_interval_secs);
        let now = Instant::now();
        let mut chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());

        match chain.block_started {
            None => chain.block_started = Some(now),
            Some(started) if now.duration_since(started) >= interval => {
                chain.height += 1;
                chain.prevhash = fake_block_hash(self.params.seed, chain.height);
                chain.block_started = Some(now);
                debug!(height = chain.height, prevhash = %chain.prevhash, "Dummy block");
            }
            Some(_) => {}
        }

        chain.merkle_seq += 1;
        let merkle = sha256d::Hash::hash(&chain.merkle_seq.to_le_bytes());

        BlockHeader {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: chain.prevhash,
            merkle_root: bitcoin::TxMerkleNode::from_raw_hash(merkle),
            time: OffsetDateTime::now_utc().unix_timestamp() as u32,
            bits: Target::MAX.to_compact_lossy(),
            nonce: 0,
        }
    }
}

fn fake_block_hash(seed: u32, height: u64) -> BlockHash {
    let mut preimage = [0u8; 12];
    preimage[..4].copy_from_slice(&seed.to_le_bytes());
    preimage[4..].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_raw_hash(sha256d::Hash::hash(&preimage))
}

#[async_trait]
impl JobSource for DummySource {
    fn class(&self) -> &'static str {
        CLASS
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }

    async fn fetch(&self) -> Result<Vec<JobTemplate>, SourceError> {
        let lifetime = Duration::from_secs(self.params.job_lifetime_secs);
        Ok((0..self.params.jobs_per_fetch)
            .map(|_| JobTemplate::new(&self.next_header(), Target::MAX, lifetime))
            .collect())
    }

    async fn submit(&self, share: &ShareSubmission) -> Result<ShareVerdict, SourceError> {
        debug!(
            nonce = format!("{:08x}", share.nonce),
            difficulty = share.difficulty,
            "Dummy share received"
        );
        Ok(ShareVerdict::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prevhash(template: &JobTemplate) -> BlockHash {
        let header: BlockHeader = bitcoin::consensus::deserialize(&template.header).unwrap();
        header.prev_blockhash
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_block_after_interval() {
        let source = DummySource::new(DummyParams {
            block_interval_secs: 10,
            ..Default::default()
        });

        let first = source.fetch().await.unwrap();
        let second = source.fetch().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(prevhash(&first[0]), prevhash(&second[0]));
        assert_ne!(first[0].header, second[0].header);

        tokio::time::advance(Duration::from_secs(10)).await;
        let third = source.fetch().await.unwrap();
        assert_ne!(prevhash(&third[0]), prevhash(&first[0]));
    }

    #[tokio::test]
    async fn test_seeds_give_distinct_chains() {
        let a = DummySource::new(DummyParams::default());
        let b = DummySource::new(DummyParams {
            seed: 1,
            ..Default::default()
        });
        let a = a.fetch().await.unwrap();
        let b = b.fetch().await.unwrap();
        assert_ne!(prevhash(&a[0]), prevhash(&b[0]));
    }

    #[test]
    fn test_params_round_trip() {
        let source = DummySource::from_params(serde_json::json!({"jobs_per_fetch": 4})).unwrap();
        assert_eq!(source.params.jobs_per_fetch, 4);
        let again = DummySource::from_params(source.params()).unwrap();
        assert_eq!(again.params, source.params);
        assert!(DummySource::from_params(serde_json::Value::Null).is_ok());
    }
}
