//! Delegate consensus: proposing on schedule, validating by replay and
//! committing on a quorum of votes.

mod producer;
mod round;
mod validator;
mod votes;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub use round::Round;
pub use votes::{quorum, validate_vote_set, VoteAggregator};

use crate::chain::ChainState;
use crate::client::{broadcast, Outbound, PeerClient};
use crate::config::NodeConfig;
use crate::crypto::address_from_public_key;
use crate::errors::{ChainError, ChainResult};
use crate::execution::ContractExecutor;
use crate::status::BlockStatus;
use crate::types::{BlockVote, Peer};

/// Timing knobs shared by the producer and the validator, in milliseconds.
#[derive(Clone, Debug)]
pub struct ConsensusSettings {
    pub interval_ms: u64,
    pub pack_margin_ms: u64,
    pub drain_batch_size: usize,
    pub contract_timeout: Duration,
    pub vote_resend_ms: u64,
}

impl ConsensusSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            interval_ms: config.block_interval_ms,
            pack_margin_ms: config.pack_margin_ms,
            drain_batch_size: config.drain_batch_size.max(1),
            contract_timeout: config.contract_timeout(),
            vote_resend_ms: config.vote_resend_interval().as_millis() as u64,
        }
    }
}

/// Consensus engine of a delegate node.
pub struct Dbft {
    chain: Arc<ChainState>,
    keypair: Arc<Keypair>,
    me: Peer,
    client: Arc<dyn PeerClient>,
    executor: Arc<dyn ContractExecutor>,
    settings: ConsensusSettings,
    scheduling: AtomicBool,
    sync_wakeup: Arc<Notify>,
}

impl Dbft {
    /// `sync_wakeup` is signalled when a quorum arrives for a block this node
    /// never replayed, so the synchronizer can fetch it by height.
    pub fn new(
        chain: Arc<ChainState>,
        keypair: Arc<Keypair>,
        client: Arc<dyn PeerClient>,
        executor: Arc<dyn ContractExecutor>,
        settings: ConsensusSettings,
        sync_wakeup: Arc<Notify>,
    ) -> ChainResult<Self> {
        let address = address_from_public_key(&keypair.public);
        let me = chain
            .round()
            .peer(&address)
            .cloned()
            .ok_or_else(|| ChainError::Config(format!("{address} is not in the delegate set")))?;
        Ok(Self {
            chain,
            keypair,
            me,
            client,
            executor,
            settings,
            scheduling: AtomicBool::new(false),
            sync_wakeup,
        })
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn me(&self) -> &Peer {
        &self.me
    }

    fn broadcast(&self, message: Outbound) {
        broadcast(self.client.clone(), &self.chain.round().peers, message);
    }

    /// Records a peer's vote and spreads the set once it reaches quorum.
    pub async fn vote_from_peer(&self, vote: BlockVote) -> ChainResult<()> {
        if vote.chain_id != self.chain.chain_id() {
            debug!(chain = vote.chain_id, "vote for another chain ignored");
            return Ok(());
        }
        if vote.block_height <= self.chain.last_height() {
            debug!(height = vote.block_height, "vote for committed height ignored");
            return Ok(());
        }
        let round = self.chain.round();
        if round.peer(&vote.voter.account).is_none() {
            warn!(voter = %vote.voter.account, "vote from non-delegate dropped");
            return Ok(());
        }
        if let Err(err) = vote.validate() {
            warn!(voter = %vote.voter.account, %err, "invalid vote dropped");
            return Ok(());
        }
        let hash = vote.block_hash.clone();
        if let Some(set) = self.chain.votes().insert(vote, round.len()) {
            debug!(hash = %hash, votes = set.len(), "quorum reached; sharing vote set");
            self.broadcast(Outbound::VoteSet(set));
        }
        Ok(())
    }

    /// Commits the block a valid vote set approves, if this node replayed it.
    pub async fn vote_result_from_peer(&self, votes: Vec<BlockVote>) -> ChainResult<()> {
        let round = self.chain.round();
        let (hash, height) = match validate_vote_set(&round, self.chain.chain_id(), &votes) {
            Ok(target) => target,
            Err(err) => {
                warn!(%err, "vote set rejected");
                return Ok(());
            }
        };
        match self.chain.statuses().status(&hash) {
            Some(BlockStatus::Saved) => Ok(()),
            Some(BlockStatus::Valid) | Some(BlockStatus::Voted) => {
                let Some(block) = self.chain.statuses().cached_block(&hash) else {
                    warn!(height, hash = %hash, "approved block missing from cache; syncing");
                    self.sync_wakeup.notify_one();
                    return Ok(());
                };
                if !self.chain.commit(&block, &votes)? {
                    debug!(height, hash = %hash, "approved block does not extend the chain");
                }
                Ok(())
            }
            status => {
                info!(height, hash = %hash, ?status, "quorum for a block never replayed here; syncing");
                self.sync_wakeup.notify_one();
                Ok(())
            }
        }
    }
}
