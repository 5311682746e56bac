use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use serde::Serialize;
use tracing::{debug, info};

use crate::chain::ChainState;
use crate::client::{HttpPeerClient, PeerClient};
use crate::config::{NodeConfig, NodeMode};
use crate::consensus::{ConsensusSettings, Dbft};
use crate::crypto::{address_from_public_key, load_or_generate_keypair};
use crate::errors::ChainResult;
use crate::execution::{BuiltinContracts, ContractExecutor};
use crate::pool::{PoolStatus, UserTxs};
use crate::storage::Storage;
use crate::supervisor::Supervisor;
use crate::sync::{SyncSettings, Synchronizer};
use crate::types::{Account, Address, Block, BlockVote, Header, Peer, Transaction, TransactionReceipt};

/// Transaction is pooled and waiting for a block.
pub const TX_STATUS_PENDING: u16 = 100;
/// Transaction is in a committed block.
pub const TX_STATUS_PROCESSED: u16 = 200;

/// Behaviour shared by every node variant.
#[async_trait]
pub trait ChainNode: Send + Sync {
    /// Launches the variant's background activities under `supervisor`.
    fn start(&self, supervisor: &Supervisor);

    async fn block_from_peer(&self, block: Block) -> ChainResult<()>;

    async fn vote_from_peer(&self, vote: BlockVote) -> ChainResult<()>;

    async fn vote_result_from_peer(&self, votes: Vec<BlockVote>) -> ChainResult<()>;

    fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>>;
}

/// Proposes, validates, votes and catches up.
pub struct DelegateNode {
    dbft: Arc<Dbft>,
    sync: Arc<Synchronizer>,
}

#[async_trait]
impl ChainNode for DelegateNode {
    fn start(&self, supervisor: &Supervisor) {
        let dbft = self.dbft.clone();
        supervisor.spawn("producer", move || Arc::clone(&dbft).try_pack());
        let sync = self.sync.clone();
        supervisor.spawn("synchronizer", move || Arc::clone(&sync).run());
    }

    async fn block_from_peer(&self, block: Block) -> ChainResult<()> {
        self.dbft.block_from_peer(block).await
    }

    async fn vote_from_peer(&self, vote: BlockVote) -> ChainResult<()> {
        self.dbft.vote_from_peer(vote).await
    }

    async fn vote_result_from_peer(&self, votes: Vec<BlockVote>) -> ChainResult<()> {
        self.dbft.vote_result_from_peer(votes).await
    }

    fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        let chain = self.dbft.chain();
        chain.storage().block_by_height(chain.chain_id(), height)
    }
}

/// Follows the delegates by height only.
pub struct FullSyncNode {
    chain: Arc<ChainState>,
    sync: Arc<Synchronizer>,
}

#[async_trait]
impl ChainNode for FullSyncNode {
    fn start(&self, supervisor: &Supervisor) {
        let sync = self.sync.clone();
        supervisor.spawn("synchronizer", move || Arc::clone(&sync).run());
    }

    async fn block_from_peer(&self, block: Block) -> ChainResult<()> {
        debug!(height = block.header.height, "full node ignores proposals");
        Ok(())
    }

    async fn vote_from_peer(&self, _vote: BlockVote) -> ChainResult<()> {
        Ok(())
    }

    async fn vote_result_from_peer(&self, _votes: Vec<BlockVote>) -> ChainResult<()> {
        self.sync.wakeup().notify_one();
        Ok(())
    }

    fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.chain
            .storage()
            .block_by_height(self.chain.chain_id(), height)
    }
}

/// Node variant chosen once at startup.
pub enum NodeKind {
    Delegate(DelegateNode),
    FullSync(FullSyncNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delegate(_) => "delegate",
            Self::FullSync(_) => "full",
        }
    }

    fn as_node(&self) -> &dyn ChainNode {
        match self {
            Self::Delegate(node) => node,
            Self::FullSync(node) => node,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub address: Address,
    pub mode: &'static str,
    pub chain_id: u64,
    pub height: u64,
    pub last_hash: String,
    pub pool: PoolStatus,
}

pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    address: Address,
    chain: Arc<ChainState>,
    kind: NodeKind,
    supervisor: Supervisor,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let storage = Storage::open(&config.db_path())?;
        let client = Arc::new(HttpPeerClient::new(config.block_interval())?);
        Self::with_parts(&config, storage, keypair, client, Arc::new(BuiltinContracts))
    }

    /// Wires a node from already opened parts.
    pub fn with_parts(
        config: &NodeConfig,
        storage: Storage,
        keypair: Keypair,
        client: Arc<dyn PeerClient>,
        executor: Arc<dyn ContractExecutor>,
    ) -> ChainResult<Self> {
        let address = address_from_public_key(&keypair.public);
        let chain = Arc::new(ChainState::from_config(config, storage)?);
        let sync = Arc::new(Synchronizer::new(
            chain.clone(),
            client.clone(),
            executor.clone(),
            &address,
            SyncSettings::from_config(config),
        ));
        let kind = match config.effective_mode(&address) {
            NodeMode::Delegate => {
                let dbft = Dbft::new(
                    chain.clone(),
                    Arc::new(keypair),
                    client,
                    executor,
                    ConsensusSettings::from_config(config),
                    sync.wakeup(),
                )?;
                NodeKind::Delegate(DelegateNode {
                    dbft: Arc::new(dbft),
                    sync,
                })
            }
            NodeMode::Full | NodeMode::Adaptive => NodeKind::FullSync(FullSyncNode {
                chain: chain.clone(),
                sync,
            }),
        };
        info!(
            %address,
            mode = kind.name(),
            height = chain.last_height(),
            "node initialised"
        );
        let supervisor = Supervisor::new(config.block_interval().max(Duration::from_millis(100)));
        Ok(Self {
            inner: Arc::new(NodeInner {
                address,
                chain,
                kind,
                supervisor,
            }),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Starts the background activities and runs until the process stops.
    pub async fn start(self) -> ChainResult<()> {
        self.handle().spawn_tasks();
        std::future::pending().await
    }
}

impl NodeHandle {
    /// Starts the background activities without blocking.
    pub fn spawn_tasks(&self) {
        info!(mode = self.inner.kind.name(), "starting node tasks");
        self.inner.kind.as_node().start(&self.inner.supervisor);
    }

    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn mode(&self) -> &'static str {
        self.inner.kind.name()
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.inner.chain
    }

    pub fn status(&self) -> NodeStatus {
        let header = self.inner.chain.last_header();
        NodeStatus {
            address: self.inner.address.clone(),
            mode: self.mode(),
            chain_id: self.inner.chain.chain_id(),
            height: header.height,
            last_hash: header.hash(),
            pool: self.inner.chain.pool().status(),
        }
    }

    pub async fn block_from_peer(&self, block: Block) -> ChainResult<()> {
        self.inner.kind.as_node().block_from_peer(block).await
    }

    pub async fn vote_from_peer(&self, vote: BlockVote) -> ChainResult<()> {
        self.inner.kind.as_node().vote_from_peer(vote).await
    }

    pub async fn vote_result_from_peer(&self, votes: Vec<BlockVote>) -> ChainResult<()> {
        self.inner.kind.as_node().vote_result_from_peer(votes).await
    }

    pub fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.kind.as_node().block_by_height(height)
    }

    pub fn header_by_height(&self, height: u64) -> ChainResult<Option<Header>> {
        let chain = &self.inner.chain;
        chain.storage().header_by_height(chain.chain_id(), height)
    }

    pub fn last_header(&self) -> Header {
        self.inner.chain.last_header()
    }

    /// Committed votes for `block_hash`, or the ones gathered so far.
    pub fn votes(&self, block_hash: &str) -> ChainResult<Vec<BlockVote>> {
        let stored = self.inner.chain.storage().votes(block_hash)?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        Ok(self.inner.chain.votes().votes(block_hash))
    }

    pub fn blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        self.inner.chain.storage().get_blob(hash)
    }

    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<String> {
        let id = self.inner.chain.new_transaction(tx)?;
        debug!(tx = %id, "transaction accepted");
        Ok(id)
    }

    pub fn account(&self, address: &str) -> ChainResult<Option<Account>> {
        self.inner.chain.account(address)
    }

    /// Highest nonce the sender has used, counting pooled transactions.
    pub fn nonce(&self, address: &str) -> ChainResult<u64> {
        let committed = self
            .inner
            .chain
            .account(address)?
            .map_or(0, |account| account.nonce);
        let pooled = self
            .inner
            .chain
            .pool()
            .user_txs(address)
            .filter(|bucket| !bucket.is_empty())
            .map_or(0, |bucket| bucket.pending_nonce());
        Ok(committed.max(pooled))
    }

    pub fn user_txs(&self, address: &str) -> Vec<Transaction> {
        self.inner
            .chain
            .pool()
            .user_txs(address)
            .as_ref()
            .map(UserTxs::transactions)
            .unwrap_or_default()
    }

    pub fn transaction_status(&self, tx_id: &str) -> ChainResult<Option<u16>> {
        if self.inner.chain.storage().receipt(tx_id)?.is_some() {
            return Ok(Some(TX_STATUS_PROCESSED));
        }
        if self.inner.chain.pool().contains(tx_id) {
            return Ok(Some(TX_STATUS_PENDING));
        }
        Ok(None)
    }

    pub fn receipt(&self, tx_id: &str) -> ChainResult<Option<TransactionReceipt>> {
        self.inner.chain.storage().receipt(tx_id)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.chain.round().peers
    }
}
