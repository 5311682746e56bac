use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{Outbound, PeerBlobSource};
use crate::errors::ChainResult;
use crate::execution::replay;
use crate::status::BlockStatus;
use crate::storage::Storage;
use crate::types::{now_millis, BlobSource, Block, BlockVote};

use super::Dbft;

/// Local blobs first, then whichever peer has them.
struct CandidateBodySource<'a> {
    storage: &'a Storage,
    peers: PeerBlobSource,
}

#[async_trait]
impl BlobSource for CandidateBodySource<'_> {
    async fn fetch_blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        match self.storage.get_blob(hash)? {
            Some(bytes) => Ok(Some(bytes)),
            None => self.peers.fetch_blob(hash).await,
        }
    }
}

impl Dbft {
    /// Decides whether to vote for a proposed block.
    ///
    /// Rejections are recorded in the status table so repeat deliveries of
    /// the same block are dropped without further work.
    pub async fn block_from_peer(&self, mut block: Block) -> ChainResult<()> {
        let interval = self.settings.interval_ms;
        let height = block.header.height;
        let hash = block.hash.clone();
        let statuses = self.chain.statuses();

        let age = now_millis().saturating_sub(block.header.timestamp);
        if age > interval {
            debug!(height, hash = %hash, age, "stale proposal");
            if statuses.status(&hash).is_none() {
                statuses.set_status(&hash, height, BlockStatus::ErrorBroadcastTime);
            }
            return Ok(());
        }

        match statuses.status(&hash) {
            None => {}
            Some(BlockStatus::Valid) => {
                if self.send_vote(&block) {
                    statuses.set_status(&hash, height, BlockStatus::Voted);
                }
                return Ok(());
            }
            Some(status) => {
                debug!(height, hash = %hash, ?status, "proposal already handled");
                return Ok(());
            }
        }

        let last = self.chain.last_header();
        if !block.header.is_child_of(&last) {
            debug!(height, last = last.height, "proposal does not extend the last header");
            return Ok(());
        }
        if let Err(err) = block.verify_seal() {
            warn!(height, hash = %hash, %err, "proposal seal rejected");
            statuses.set_status(&hash, height, BlockStatus::ErrorPackTime);
            return Ok(());
        }
        let round = self.chain.round();
        if !round.is_eligible(&last, &block.header.coinbase, block.header.timestamp, interval) {
            warn!(height, hash = %hash, miner = %block.header.coinbase, "proposer not entitled to this slot");
            statuses.set_status(&hash, height, BlockStatus::ErrorPackTime);
            return Ok(());
        }

        let source = CandidateBodySource {
            storage: self.chain.storage(),
            peers: PeerBlobSource::new(self.client.clone(), round.peers.clone()),
        };
        if let Err(err) = block.load_body(&source).await {
            warn!(height, hash = %hash, %err, "could not load proposal body");
            return Ok(());
        }

        let replayed = replay(
            &last,
            block.header.coinbase.clone(),
            block.header.timestamp,
            block.transactions()?,
            self.chain.node_store(),
            self.executor.clone(),
            self.settings.contract_timeout,
        )
        .await?;
        if replayed.header != block.header || replayed.receipts.as_slice() != block.receipts()? {
            warn!(height, hash = %hash, "replay disagrees with proposal");
            statuses.set_status(&hash, height, BlockStatus::ErrorBody);
            return Ok(());
        }

        self.chain
            .storage()
            .store_body(&replayed.transactions, &replayed.receipts)?;
        statuses.cache_block(block.clone());
        // Valid until a vote actually leaves; a later delivery retries.
        let status = if self.send_vote(&block) {
            info!(height, hash = %hash, "proposal replayed; voted");
            BlockStatus::Voted
        } else {
            BlockStatus::Valid
        };
        statuses.set_status(&hash, height, status);
        Ok(())
    }

    /// Signs and broadcasts an approval, at most once per resend window per height.
    /// Returns whether a vote went out.
    fn send_vote(&self, block: &Block) -> bool {
        let height = block.header.height;
        if !self
            .chain
            .statuses()
            .try_record_vote(height, now_millis(), self.settings.vote_resend_ms)
        {
            debug!(height, "vote for this height sent recently");
            return false;
        }
        let vote = BlockVote::signed(
            self.chain.chain_id(),
            block.hash.clone(),
            height,
            self.me.clone(),
            &self.keypair,
        );
        self.broadcast(Outbound::Vote(vote));
        true
    }
}
