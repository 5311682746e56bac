//! Fixtures shared by the consensus and sync unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::chain::ChainState;
use crate::client::PeerClient;
use crate::config::{GenesisAccount, GenesisConfig};
use crate::consensus::Round;
use crate::crypto::{address_from_public_key, generate_keypair};
use crate::errors::ChainResult;
use crate::execution::{replay, BuiltinContracts};
use crate::storage::Storage;
use crate::types::{Address, Block, BlockVote, Header, Peer, Transaction};

pub(crate) const CHAIN_ID: u64 = 7;
pub(crate) const INTERVAL_MS: u64 = 10_000;

/// One node's view of a two-delegate network plus a funded user.
pub(crate) struct Network {
    pub keys: Vec<Arc<Keypair>>,
    pub peers: Vec<Peer>,
    pub user: Keypair,
    pub chain: Arc<ChainState>,
    _dir: TempDir,
}

impl Network {
    pub fn new(delegates: usize) -> Self {
        let keys: Vec<Arc<Keypair>> = (0..delegates).map(|_| Arc::new(generate_keypair())).collect();
        let peers: Vec<Peer> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| Peer {
                account: address_from_public_key(&key.public),
                address: "127.0.0.1".into(),
                port: 21_000 + i as u16,
                weight: 1,
            })
            .collect();
        let user = generate_keypair();
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: address_from_public_key(&user.public),
                amount: 1_000,
                gas: 100,
            }],
            tokens: Vec::new(),
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let chain = ChainState::open(CHAIN_ID, storage, &genesis, Round::new(peers.clone()), 64).expect("chain");
        Self {
            keys,
            peers,
            user,
            chain: Arc::new(chain),
            _dir: dir,
        }
    }

    pub fn transfer(&self, amount: i64, nonce: u64) -> Transaction {
        Transaction::signed(&self.user, "cd".repeat(32), nonce, amount, 1, nonce, String::new(), String::new())
    }

    /// A block sealed by delegate `proposer` on top of the local last header.
    pub async fn propose(&self, proposer: usize, timestamp: u64, transactions: &[Transaction]) -> Block {
        let miner = &self.peers[proposer];
        let built = replay(
            &self.chain.last_header(),
            miner.account.clone(),
            timestamp,
            transactions,
            self.chain.node_store(),
            Arc::new(BuiltinContracts),
            Duration::from_secs(1),
        )
        .await
        .expect("build");
        Block::seal(built.header, miner.clone(), &self.keys[proposer], built.transactions, built.receipts)
    }

    /// Re-signs `header` as delegate `proposer`, keeping the body of `block`.
    pub fn reseal(&self, block: &Block, header: Header, proposer: usize) -> Block {
        let mut resealed = Block::seal(
            header,
            self.peers[proposer].clone(),
            &self.keys[proposer],
            Vec::new(),
            Vec::new(),
        );
        resealed.transactions = block.transactions.clone();
        resealed.receipts = block.receipts.clone();
        resealed
    }

    pub fn vote(&self, voter: usize, block_hash: &str, height: u64) -> BlockVote {
        BlockVote::signed(
            CHAIN_ID,
            block_hash.to_string(),
            height,
            self.peers[voter].clone(),
            &self.keys[voter],
        )
    }

    pub fn vote_set(&self, block_hash: &str, height: u64) -> Vec<BlockVote> {
        (0..self.peers.len()).map(|i| self.vote(i, block_hash, height)).collect()
    }
}

/// Peer client that records outbound messages and serves canned blocks.
#[derive(Default)]
pub(crate) struct RecordingClient {
    sent: Mutex<Vec<(Address, &'static str)>>,
    blocks: Mutex<HashMap<u64, Block>>,
    votes: Mutex<HashMap<String, Vec<BlockVote>>>,
}

impl RecordingClient {
    pub fn serve(&self, block: Block, votes: Vec<BlockVote>) {
        self.votes.lock().insert(block.hash.clone(), votes);
        self.blocks.lock().insert(block.header.height, block);
    }

    pub fn sent(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|(_, sent)| *sent == kind).count()
    }

    fn record(&self, peer: &Peer, kind: &'static str) {
        self.sent.lock().push((peer.account.clone(), kind));
    }
}

#[async_trait]
impl PeerClient for RecordingClient {
    async fn send_block(&self, peer: &Peer, _block: &Block) -> ChainResult<()> {
        self.record(peer, "block");
        Ok(())
    }

    async fn send_vote(&self, peer: &Peer, _vote: &BlockVote) -> ChainResult<()> {
        self.record(peer, "vote");
        Ok(())
    }

    async fn send_vote_set(&self, peer: &Peer, _votes: &[BlockVote]) -> ChainResult<()> {
        self.record(peer, "vote set");
        Ok(())
    }

    async fn header_by_height(&self, _peer: &Peer, height: u64) -> ChainResult<Option<Header>> {
        Ok(self.blocks.lock().get(&height).map(|block| block.header.clone()))
    }

    async fn block_by_height(&self, _peer: &Peer, height: u64) -> ChainResult<Option<Block>> {
        Ok(self.blocks.lock().get(&height).cloned())
    }

    async fn last_header(&self, _peer: &Peer) -> ChainResult<Option<Header>> {
        let blocks = self.blocks.lock();
        Ok(blocks
            .keys()
            .max()
            .and_then(|height| blocks.get(height))
            .map(|block| block.header.clone()))
    }

    async fn votes(&self, _peer: &Peer, block_hash: &str) -> ChainResult<Vec<BlockVote>> {
        Ok(self.votes.lock().get(block_hash).cloned().unwrap_or_default())
    }

    async fn blob(&self, _peer: &Peer, _hash: &str) -> ChainResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Lets detached broadcast tasks run.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
