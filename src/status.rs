use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::Block;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Saved,
    Valid,
    Voted,
    ErrorBroadcastTime,
    ErrorPackTime,
    ErrorBody,
}

impl BlockStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorBroadcastTime | Self::ErrorPackTime | Self::ErrorBody
        )
    }
}

#[derive(Default)]
struct StatusInner {
    statuses: HashMap<String, (u64, BlockStatus)>,
    pack_attempts: HashMap<u64, u64>,
    vote_times: HashMap<u64, u64>,
    candidates: HashMap<String, Block>,
}

/// Per-block decisions and per-height attempt times.
///
/// Every check-and-record operation runs under one lock, so a scheduled
/// proposal and a sync-triggered one cannot both pass for the same height.
#[derive(Default)]
pub struct BlockStatusTable {
    inner: Mutex<StatusInner>,
}

impl BlockStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, hash: &str) -> Option<BlockStatus> {
        self.inner.lock().statuses.get(hash).map(|(_, status)| *status)
    }

    pub fn set_status(&self, hash: &str, height: u64, status: BlockStatus) {
        self.inner
            .lock()
            .statuses
            .insert(hash.to_string(), (height, status));
    }

    /// Records a proposal attempt unless one happened within `window` ms.
    pub fn try_begin_pack(&self, height: u64, now: u64, window: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.pack_attempts.get(&height) {
            Some(last) if now.saturating_sub(*last) < window => false,
            _ => {
                inner.pack_attempts.insert(height, now);
                true
            }
        }
    }

    /// Records a vote for `height` unless one was sent within `window` ms.
    pub fn try_record_vote(&self, height: u64, now: u64, window: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.vote_times.get(&height) {
            Some(last) if now.saturating_sub(*last) < window => false,
            _ => {
                inner.vote_times.insert(height, now);
                true
            }
        }
    }

    pub fn cache_block(&self, block: Block) {
        self.inner
            .lock()
            .candidates
            .insert(block.hash.clone(), block);
    }

    pub fn cached_block(&self, hash: &str) -> Option<Block> {
        self.inner.lock().candidates.get(hash).cloned()
    }

    /// Forgets everything about heights below `height`.
    pub fn prune_below(&self, height: u64) {
        let mut inner = self.inner.lock();
        inner.statuses.retain(|_, (h, _)| *h >= height);
        inner.pack_attempts.retain(|h, _| *h >= height);
        inner.vote_times.retain(|h, _| *h >= height);
        inner.candidates.retain(|_, block| block.header.height >= height);
    }
}
