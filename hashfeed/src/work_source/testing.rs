//! Scripted job source for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;

use super::{JobSource, ShareSubmission, ShareVerdict, SourceError};
use crate::job::JobTemplate;
use crate::types::{BlockHash, BlockHeader, Target};

static MERKLE_SEQ: AtomicU32 = AtomicU32::new(1);

/// An easy job building on prevhash `[prev; 32]`. Every call yields a
/// distinct header.
pub(crate) fn template(prev: u8, lifetime_secs: u64) -> JobTemplate {
    let seq = MERKLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut merkle = [0u8; 32];
    merkle[..4].copy_from_slice(&seq.to_le_bytes());

    let header = BlockHeader {
        version: bitcoin::block::Version::ONE,
        prev_blockhash: BlockHash::from_byte_array([prev; 32]),
        merkle_root: bitcoin::TxMerkleNode::from_byte_array(merkle),
        time: 1_700_000_000,
        bits: bitcoin::CompactTarget::from_consensus(0x1d00_ffff),
        nonce: 0,
    };
    JobTemplate::new(&header, Target::MAX, Duration::from_secs(lifetime_secs))
}

enum Mode {
    /// Pop scripted results, then return nothing.
    Scripted,
    /// One fresh job on the given prevhash per fetch.
    Endless(u8),
    /// Never complete a fetch.
    Hang,
}

pub(crate) struct ScriptedSource {
    mode: Mutex<Mode>,
    fetch_script: Mutex<VecDeque<Result<Vec<JobTemplate>, SourceError>>>,
    verdicts: Mutex<VecDeque<Result<ShareVerdict, SourceError>>>,
    submissions: Mutex<Vec<ShareSubmission>>,
    fetches: AtomicUsize,
    starts: AtomicUsize,
}

impl ScriptedSource {
    fn with_mode(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            fetch_script: Mutex::new(VecDeque::new()),
            verdicts: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::with_mode(Mode::Scripted)
    }

    pub(crate) fn endless(prev: u8) -> Arc<Self> {
        Self::with_mode(Mode::Endless(prev))
    }

    pub(crate) fn hanging() -> Arc<Self> {
        Self::with_mode(Mode::Hang)
    }

    /// Switch an endless source to a new block.
    pub(crate) fn set_prev(&self, prev: u8) {
        *self.mode.lock().unwrap() = Mode::Endless(prev);
    }

    pub(crate) fn push_jobs(&self, jobs: Vec<JobTemplate>) {
        self.fetch_script.lock().unwrap().push_back(Ok(jobs));
    }

    pub(crate) fn push_error(&self) {
        self.fetch_script
            .lock()
            .unwrap()
            .push_back(Err(SourceError::Connection("scripted failure".into())));
    }

    /// Queue a reply to the next submission. Unscripted submissions are
    /// accepted.
    pub(crate) fn push_verdict(&self, verdict: Result<ShareVerdict, SourceError>) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn submissions(&self) -> Vec<ShareSubmission> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSource for ScriptedSource {
    fn class(&self) -> &'static str {
        "scripted"
    }

    async fn start(&self) -> Result<(), SourceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<JobTemplate>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.fetch_script.lock().unwrap().pop_front() {
            return result;
        }
        let endless = match *self.mode.lock().unwrap() {
            Mode::Scripted => return Ok(Vec::new()),
            Mode::Endless(prev) => Some(prev),
            Mode::Hang => None,
        };
        match endless {
            Some(prev) => Ok(vec![template(prev, 3600)]),
            None => std::future::pending().await,
        }
    }

    async fn submit(&self, share: &ShareSubmission) -> Result<ShareVerdict, SourceError> {
        self.submissions.lock().unwrap().push(share.clone());
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ShareVerdict::Accepted))
    }
}
