use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::errors::{ChainError, ChainResult};
use crate::types::BlockVote;

use super::Round;

/// Smallest vote count that commits a block in a round of `peers` delegates.
pub fn quorum(peers: usize) -> usize {
    peers / 2 + 1
}

/// Per-block vote sets.
#[derive(Default)]
pub struct VoteAggregator {
    sets: Mutex<HashMap<String, Vec<BlockVote>>>,
}

impl VoteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `vote` unless its voter already voted for the block.
    ///
    /// Returns the whole set whenever the insertion leaves it at or above
    /// quorum, so the caller can disseminate it.
    pub fn insert(&self, vote: BlockVote, peers: usize) -> Option<Vec<BlockVote>> {
        let mut sets = self.sets.lock();
        let set = sets.entry(vote.block_hash.clone()).or_default();
        if set
            .iter()
            .any(|existing| existing.voter.account == vote.voter.account)
        {
            return None;
        }
        set.push(vote);
        (set.len() >= quorum(peers)).then(|| set.clone())
    }

    pub fn votes(&self, block_hash: &str) -> Vec<BlockVote> {
        self.sets
            .lock()
            .get(block_hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn prune_below(&self, height: u64) {
        self.sets.lock().retain(|_, set| {
            set.first()
                .map_or(false, |vote| vote.block_height >= height)
        });
    }
}

/// Checks that `votes` is a quorum of distinct, valid approvals from round
/// members for one block, and returns that block's hash and height.
pub fn validate_vote_set(
    round: &Round,
    chain_id: u64,
    votes: &[BlockVote],
) -> ChainResult<(String, u64)> {
    let first = votes
        .first()
        .ok_or_else(|| ChainError::Block("empty vote set".into()))?;
    let mut voters = HashSet::new();
    for vote in votes {
        if vote.block_hash != first.block_hash || vote.block_height != first.block_height {
            return Err(ChainError::Block("vote set mixes blocks".into()));
        }
        if vote.chain_id != chain_id {
            return Err(ChainError::Block(format!(
                "vote for chain {} on chain {chain_id}",
                vote.chain_id
            )));
        }
        vote.validate()?;
        if round.peer(&vote.voter.account).is_none() {
            return Err(ChainError::Block(format!(
                "voter {} is not a delegate",
                vote.voter.account
            )));
        }
        if !voters.insert(vote.voter.account.as_str()) {
            return Err(ChainError::Block(format!(
                "duplicate vote from {}",
                vote.voter.account
            )));
        }
    }
    if voters.len() < quorum(round.len()) {
        return Err(ChainError::Block(format!(
            "{} votes do not reach quorum of {} delegates",
            voters.len(),
            round.len()
        )));
    }
    Ok((first.block_hash.clone(), first.block_height))
}
