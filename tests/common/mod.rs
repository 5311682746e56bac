#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use parking_lot::RwLock;
use tempfile::TempDir;

use delegate_chain::client::PeerClient;
use delegate_chain::config::{GenesisAccount, GenesisConfig, NodeConfig, NodeMode, PeerConfig};
use delegate_chain::crypto::{address_from_public_key, generate_keypair};
use delegate_chain::errors::{ChainError, ChainResult};
use delegate_chain::execution::BuiltinContracts;
use delegate_chain::node::{Node, NodeHandle};
use delegate_chain::storage::Storage;
use delegate_chain::types::{Address, Block, BlockVote, Header, Peer};

pub const INTERVAL_MS: u64 = 1_000;
pub const PACK_MARGIN_MS: u64 = 300;
pub const USER_FUNDS: i64 = 10_000;
pub const USER_GAS: i64 = 1_000;

/// Routes peer calls between in-process nodes, through the same JSON
/// encoding the HTTP transport uses.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<Address, NodeHandle>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeHandle) {
        self.nodes
            .write()
            .insert(node.address().to_string(), node);
    }

    pub fn disconnect(&self, address: &str) {
        self.nodes.write().remove(address);
    }

    fn node(&self, peer: &Peer) -> ChainResult<NodeHandle> {
        self.nodes
            .read()
            .get(&peer.account)
            .cloned()
            .ok_or_else(|| ChainError::Network(format!("{} unreachable", peer.account)))
    }
}

fn over_wire<T: serde::Serialize + serde::de::DeserializeOwned>(value: &T) -> ChainResult<T> {
    Ok(serde_json::from_slice(&serde_json::to_vec(value)?)?)
}

#[async_trait]
impl PeerClient for LocalNetwork {
    async fn send_block(&self, peer: &Peer, block: &Block) -> ChainResult<()> {
        let node = self.node(peer)?;
        node.block_from_peer(over_wire(block)?).await
    }

    async fn send_vote(&self, peer: &Peer, vote: &BlockVote) -> ChainResult<()> {
        let node = self.node(peer)?;
        node.vote_from_peer(over_wire(vote)?).await
    }

    async fn send_vote_set(&self, peer: &Peer, votes: &[BlockVote]) -> ChainResult<()> {
        let node = self.node(peer)?;
        node.vote_result_from_peer(over_wire(&votes.to_vec())?).await
    }

    async fn header_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Header>> {
        self.node(peer)?.header_by_height(height)
    }

    async fn block_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Block>> {
        let block = self.node(peer)?.block_by_height(height)?;
        block.as_ref().map(over_wire).transpose()
    }

    async fn last_header(&self, peer: &Peer) -> ChainResult<Option<Header>> {
        Ok(Some(self.node(peer)?.last_header()))
    }

    async fn votes(&self, peer: &Peer, block_hash: &str) -> ChainResult<Vec<BlockVote>> {
        self.node(peer)?.votes(block_hash)
    }

    async fn blob(&self, peer: &Peer, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        self.node(peer)?.blob(hash)
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub keypair: Keypair,
    _dir: TempDir,
}

pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    pub delegates: Vec<Keypair>,
    pub user: Keypair,
    pub config: NodeConfig,
}

impl Cluster {
    /// Delegate keys, a funded user and a shared config template.
    pub fn new(delegates: usize) -> Self {
        let keys: Vec<Keypair> = (0..delegates).map(|_| generate_keypair()).collect();
        let user = generate_keypair();
        let peers = keys
            .iter()
            .enumerate()
            .map(|(i, key)| PeerConfig {
                account: address_from_public_key(&key.public),
                address: "127.0.0.1".into(),
                port: 29_000 + i as u16,
                weight: 1,
            })
            .collect();
        let config = NodeConfig {
            chain_id: 1,
            block_interval_ms: INTERVAL_MS,
            pack_margin_ms: PACK_MARGIN_MS,
            vote_resend_interval_ms: Some(INTERVAL_MS),
            sync_failure_threshold: 2,
            peers,
            genesis: GenesisConfig {
                accounts: vec![GenesisAccount {
                    address: address_from_public_key(&user.public),
                    amount: USER_FUNDS,
                    gas: USER_GAS,
                }],
                tokens: Vec::new(),
            },
            ..NodeConfig::default()
        };
        Self {
            network: LocalNetwork::new(),
            delegates: keys,
            user,
            config,
        }
    }

    pub fn user_address(&self) -> Address {
        address_from_public_key(&self.user.public)
    }

    /// Builds the node for delegate `index`, registered on the network but not started.
    pub fn delegate(&self, index: usize) -> TestNode {
        let keypair = Keypair::from_bytes(&self.delegates[index].to_bytes()).expect("keypair copy");
        self.build(keypair, NodeMode::Delegate)
    }

    /// Builds a node outside the delegate set.
    pub fn full_node(&self) -> TestNode {
        self.build(generate_keypair(), NodeMode::Full)
    }

    fn build(&self, keypair: Keypair, mode: NodeMode) -> TestNode {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = self.config.clone();
        config.mode = mode;
        config.data_dir = dir.path().to_path_buf();
        let storage = Storage::open(&config.db_path()).expect("storage");
        let node_keypair = Keypair::from_bytes(&keypair.to_bytes()).expect("keypair copy");
        let node = Node::with_parts(
            &config,
            storage,
            node_keypair,
            self.network.clone(),
            Arc::new(BuiltinContracts),
        )
        .expect("node");
        let handle = node.handle();
        self.network.register(handle.clone());
        TestNode {
            handle,
            keypair,
            _dir: dir,
        }
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
