//! Height-driven catch-up.
//!
//! When the chain does not advance for a whole interval, the synchronizer asks
//! peers for the next block by height together with its vote set, replays it
//! and commits it through the same path as a live quorum.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::chain::ChainState;
use crate::client::{PeerBlobSource, PeerClient};
use crate::config::NodeConfig;
use crate::consensus::validate_vote_set;
use crate::errors::{ChainError, ChainResult};
use crate::execution::{replay, ContractExecutor};
use crate::status::BlockStatus;
use crate::types::Peer;

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub interval: Duration,
    pub contract_timeout: Duration,
    pub failure_threshold: u32,
}

impl SyncSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            interval: config.block_interval(),
            contract_timeout: config.contract_timeout(),
            failure_threshold: config.sync_failure_threshold.max(1),
        }
    }
}

/// Outcome of one catch-up pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub start_height: u64,
    pub synced: u64,
}

pub struct Synchronizer {
    chain: Arc<ChainState>,
    client: Arc<dyn PeerClient>,
    executor: Arc<dyn ContractExecutor>,
    peers: Vec<Peer>,
    settings: SyncSettings,
    wakeup: Arc<Notify>,
}

impl Synchronizer {
    /// `own_account` is left out of the peers asked for blocks.
    pub fn new(
        chain: Arc<ChainState>,
        client: Arc<dyn PeerClient>,
        executor: Arc<dyn ContractExecutor>,
        own_account: &str,
        settings: SyncSettings,
    ) -> Self {
        let peers = chain
            .round()
            .peers
            .into_iter()
            .filter(|peer| peer.account != own_account)
            .collect();
        Self {
            chain,
            client,
            executor,
            peers,
            settings,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Handle that makes the loop check for missing blocks immediately.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Watches the chain height and catches up whenever it stalls.
    pub async fn run(self: Arc<Self>) -> ChainResult<()> {
        let mut observed = self.chain.last_height();
        let mut failures = 0u32;
        loop {
            let woken = tokio::select! {
                _ = self.wakeup.notified() => true,
                _ = tokio::time::sleep(self.settings.interval) => false,
            };
            let height = self.chain.last_height();
            if height != observed && !woken {
                observed = height;
                failures = 0;
                continue;
            }
            match self.catch_up().await {
                Ok(report) => {
                    if report.synced > 0 {
                        info!(from = report.start_height, blocks = report.synced, "caught up with peers");
                    }
                    failures = 0;
                }
                Err(err) => {
                    failures += 1;
                    warn!(height = height + 1, attempt = failures, %err, "sync attempt failed");
                    if failures >= self.settings.failure_threshold {
                        tokio::time::sleep(self.settings.interval).await;
                        failures = 0;
                    }
                }
            }
            observed = self.chain.last_height();
        }
    }

    /// Fetches and commits blocks until no peer has one beyond the last header.
    pub async fn catch_up(&self) -> ChainResult<SyncReport> {
        let start_height = self.chain.last_height();
        let mut report = SyncReport {
            start_height,
            synced: 0,
        };
        while self.sync_height(self.chain.last_height() + 1).await? {
            report.synced += 1;
        }
        Ok(report)
    }

    /// Tries every peer in turn for the block at `height`.
    ///
    /// `Ok(false)` means no peer has it yet; `Err` means at least one peer had
    /// something and none of it could be committed.
    pub async fn sync_height(&self, height: u64) -> ChainResult<bool> {
        let mut last_error = None;
        for peer in &self.peers {
            match self.sync_from(peer, height).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => {
                    debug!(peer = %peer.account, height, %err, "peer could not serve block");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    async fn sync_from(&self, peer: &Peer, height: u64) -> ChainResult<bool> {
        let Some(mut block) = self.client.block_by_height(peer, height).await? else {
            return Ok(false);
        };
        if self.chain.statuses().status(&block.hash) == Some(BlockStatus::Saved) {
            return Ok(true);
        }
        let votes = self.client.votes(peer, &block.hash).await?;
        let round = self.chain.round();
        let (hash, voted_height) = validate_vote_set(&round, self.chain.chain_id(), &votes)?;
        if hash != block.hash || voted_height != height {
            return Err(ChainError::Block(format!(
                "votes from {} approve {hash} at {voted_height}",
                peer.account
            )));
        }
        block.verify_seal()?;

        let parent = self.chain.last_header();
        if !block.header.is_child_of(&parent) {
            return Err(ChainError::Block(format!(
                "block {} does not extend height {}",
                block.hash, parent.height
            )));
        }
        if !round.is_eligible(
            &parent,
            &block.header.coinbase,
            block.header.timestamp,
            self.settings.interval.as_millis() as u64,
        ) {
            return Err(ChainError::Block(format!(
                "block {} was proposed outside its miner's slot",
                block.hash
            )));
        }

        let mut sources = vec![peer.clone()];
        sources.extend(self.peers.iter().filter(|other| *other != peer).cloned());
        block
            .load_body(&PeerBlobSource::new(self.client.clone(), sources))
            .await?;
        let replayed = replay(
            &parent,
            block.header.coinbase.clone(),
            block.header.timestamp,
            block.transactions()?,
            self.chain.node_store(),
            self.executor.clone(),
            self.settings.contract_timeout,
        )
        .await?;
        if replayed.header != block.header {
            return Err(ChainError::Block(format!(
                "replay of {} from {} disagrees with its header",
                block.hash, peer.account
            )));
        }
        self.chain.commit(&block, &votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::BuiltinContracts;
    use crate::test_support::{Network, RecordingClient, INTERVAL_MS};
    use crate::types::now_millis;

    fn follower(network: &Network, client: Arc<RecordingClient>) -> Synchronizer {
        let settings = SyncSettings {
            interval: Duration::from_millis(INTERVAL_MS),
            contract_timeout: Duration::from_secs(1),
            failure_threshold: 1,
        };
        Synchronizer::new(
            network.chain.clone(),
            client,
            Arc::new(BuiltinContracts),
            &network.peers[1].account,
            settings,
        )
    }

    #[tokio::test]
    async fn votes_for_another_hash_are_refused() {
        let network = Network::new(2);
        let client = Arc::new(RecordingClient::default());
        let block = network.propose(0, now_millis(), &[network.transfer(10, 1)]).await;
        client.serve(block, network.vote_set(&"ee".repeat(32), 1));

        let sync = follower(&network, client);
        assert!(matches!(sync.sync_height(1).await, Err(ChainError::Block(_))));
        assert_eq!(network.chain.last_height(), 0);
    }

    #[tokio::test]
    async fn votes_for_another_height_are_refused() {
        let network = Network::new(2);
        let client = Arc::new(RecordingClient::default());
        let block = network.propose(0, now_millis(), &[]).await;
        let votes = network.vote_set(&block.hash, 2);
        client.serve(block, votes);

        let sync = follower(&network, client);
        assert!(matches!(sync.sync_height(1).await, Err(ChainError::Block(_))));
        assert_eq!(network.chain.last_height(), 0);
    }

    #[tokio::test]
    async fn approved_block_is_replayed_and_committed() {
        let network = Network::new(2);
        let client = Arc::new(RecordingClient::default());
        let block = network.propose(0, now_millis(), &[network.transfer(10, 1)]).await;
        let votes = network.vote_set(&block.hash, 1);
        client.serve(block.clone(), votes);
        let early = network.vote(0, &block.hash, 1);
        assert!(network.chain.votes().insert(early, 2).is_none());

        let sync = follower(&network, client);
        assert!(sync.sync_height(1).await.expect("synced"));
        // Live votes for a height committed by sync are dropped too.
        assert!(network.chain.votes().votes(&block.hash).is_empty());
        assert_eq!(network.chain.last_header(), block.header);
        assert_eq!(network.chain.statuses().status(&block.hash), Some(BlockStatus::Saved));
        assert!(!sync.sync_height(2).await.expect("nothing further"));

        let report = sync.catch_up().await.expect("caught up");
        assert_eq!(report, SyncReport { start_height: 1, synced: 0 });
    }

    #[tokio::test]
    async fn forged_header_is_not_committed() {
        let network = Network::new(2);
        let client = Arc::new(RecordingClient::default());
        let honest = network.propose(0, now_millis(), &[network.transfer(10, 1)]).await;
        let mut header = honest.header.clone();
        header.state_root = "00".repeat(32);
        let forged = network.reseal(&honest, header, 0);
        let votes = network.vote_set(&forged.hash, 1);
        client.serve(forged, votes);

        let sync = follower(&network, client);
        assert!(sync.sync_height(1).await.is_err());
        assert_eq!(network.chain.last_height(), 0);
    }
}
