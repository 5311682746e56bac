use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::info;

use crate::config::{GenesisConfig, NodeConfig};
use crate::consensus::{Round, VoteAggregator};
use crate::errors::{ChainError, ChainResult};
use crate::pool::TxPool;
use crate::state::{NodeStore, StateTree};
use crate::status::{BlockStatus, BlockStatusTable};
use crate::storage::Storage;
use crate::types::{is_account_address, is_builtin_token, Account, Block, BlockVote, Header, Token, Transaction};

/// Last committed header, the round it was produced in, and the pool it feeds.
///
/// Every commit goes through [`ChainState::commit`], whether the block was
/// voted in live or fetched by the synchronizer.
pub struct ChainState {
    chain_id: u64,
    last_header: Mutex<Header>,
    round: RwLock<Round>,
    statuses: BlockStatusTable,
    votes: VoteAggregator,
    pool: TxPool,
    storage: Storage,
    nodes: Arc<dyn NodeStore>,
    committed: Notify,
}

impl ChainState {
    /// Resumes from the persisted last header, or writes genesis on an empty store.
    pub fn open(
        chain_id: u64,
        storage: Storage,
        genesis: &GenesisConfig,
        round: Round,
        pool_limit: usize,
    ) -> ChainResult<Self> {
        let nodes: Arc<dyn NodeStore> = Arc::new(storage.clone());
        let last_header = match storage.last_header(chain_id)? {
            Some(header) => {
                info!(height = header.height, hash = %header.hash(), "recovered chain state");
                header
            }
            None => {
                let header = build_genesis(nodes.clone(), genesis)?;
                storage.store_genesis(chain_id, &header)?;
                info!(hash = %header.hash(), accounts = genesis.accounts.len(), "wrote genesis header");
                header
            }
        };
        let mut round = round;
        if last_header.height > 0 {
            round.update_index(&last_header.coinbase);
        }
        Ok(Self {
            chain_id,
            last_header: Mutex::new(last_header),
            round: RwLock::new(round),
            statuses: BlockStatusTable::new(),
            votes: VoteAggregator::new(),
            pool: TxPool::new(pool_limit),
            storage,
            nodes,
            committed: Notify::new(),
        })
    }

    pub fn from_config(config: &NodeConfig, storage: Storage) -> ChainResult<Self> {
        Self::open(
            config.chain_id,
            storage,
            &config.genesis,
            Round::new(config.round_peers()),
            config.pool_limit,
        )
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn last_header(&self) -> Header {
        self.last_header.lock().clone()
    }

    pub fn last_height(&self) -> u64 {
        self.last_header.lock().height
    }

    pub fn set_last_header(&self, header: Header) {
        *self.last_header.lock() = header;
    }

    /// Snapshot of the delegate schedule.
    pub fn round(&self) -> Round {
        self.round.read().clone()
    }

    pub fn statuses(&self) -> &BlockStatusTable {
        &self.statuses
    }

    /// Votes gathered for blocks above the last header.
    pub fn votes(&self) -> &VoteAggregator {
        &self.votes
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn node_store(&self) -> Arc<dyn NodeStore> {
        self.nodes.clone()
    }

    pub fn state(&self) -> ChainResult<StateTree> {
        StateTree::at_hex(self.nodes.clone(), &self.last_header().state_root)
    }

    pub fn account(&self, address: &str) -> ChainResult<Option<Account>> {
        self.state()?.account(address)
    }

    /// Token registry as of the last header.
    pub fn tokens(&self) -> ChainResult<StateTree> {
        StateTree::at_hex(self.nodes.clone(), &self.last_header().token_root)
    }

    pub fn token(&self, address: &str) -> ChainResult<Option<Token>> {
        self.tokens()?.token(address)
    }

    /// Admits a user transaction into the pool.
    pub fn new_transaction(&self, tx: Transaction) -> ChainResult<String> {
        tx.validate()?;
        if !self.tokens()?.is_registered_token(&tx.token_address)? {
            return Err(ChainError::Transaction(format!(
                "token {} is not registered",
                tx.token_address
            )));
        }
        let confirmed_nonce = self
            .account(&tx.from)?
            .map(|account| account.nonce)
            .unwrap_or(0);
        let id = tx.id();
        self.pool.park(tx.clone(), confirmed_nonce)?;
        self.storage.store_transaction(&tx)?;
        Ok(id)
    }

    /// Persists `block` with its votes, then advances the last header, the
    /// round index and the status table, and reconciles the pool.
    ///
    /// Returns `false` without side effects unless `block` extends the current
    /// last header. The header lock is held across the write so two committers
    /// cannot both extend the same parent.
    pub fn commit(&self, block: &Block, votes: &[BlockVote]) -> ChainResult<bool> {
        let mut last = self.last_header.lock();
        if !block.header.is_child_of(&last) {
            return Ok(false);
        }
        let transactions = block.transactions()?;
        let state = StateTree::at_hex(self.nodes.clone(), &block.header.state_root)?;
        let mut confirmed = HashMap::new();
        for tx in transactions {
            if !confirmed.contains_key(&tx.from) {
                let nonce = state.account(&tx.from)?.map_or(0, |account| account.nonce);
                confirmed.insert(tx.from.clone(), nonce);
            }
        }
        self.storage.commit_block(self.chain_id, block, votes)?;
        *last = block.header.clone();
        drop(last);

        let height = block.header.height;
        self.round.write().update_index(&block.header.coinbase);
        self.statuses.prune_below(height);
        self.votes.prune_below(height + 1);
        self.statuses.set_status(&block.hash, height, BlockStatus::Saved);
        self.pool.notify(transactions, &confirmed);
        self.committed.notify_waiters();
        info!(
            height,
            hash = %block.hash,
            miner = %block.header.coinbase,
            txs = transactions.len(),
            votes = votes.len(),
            "committed block"
        );
        Ok(true)
    }

    /// Waits until the next commit or until `timeout` elapses.
    pub async fn wait_for_commit(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.committed.notified())
            .await
            .is_ok()
    }
}

fn build_genesis(nodes: Arc<dyn NodeStore>, genesis: &GenesisConfig) -> ChainResult<Header> {
    let mut seen = HashSet::new();
    let mut state = StateTree::empty(nodes.clone());
    for entry in &genesis.accounts {
        if !seen.insert(entry.address.as_str()) {
            return Err(ChainError::Config(format!(
                "genesis account {} listed twice",
                entry.address
            )));
        }
        let account = Account::with_funds(entry.address.clone(), entry.amount, entry.gas);
        state.store_account(&account)?;
    }

    let mut tokens = StateTree::empty(nodes);
    let mut registered = HashSet::new();
    for entry in &genesis.tokens {
        let token = Token {
            address: entry.address.clone(),
            name: entry.name.clone(),
            decimals: entry.decimals,
            total: entry.total,
            issuer: entry.issuer.clone(),
        };
        if !token.is_well_formed() || is_builtin_token(&token.address) {
            return Err(ChainError::Config(format!(
                "genesis token {} needs a lowercase 32-byte address, a name, decimals and a supply",
                token.address
            )));
        }
        if !is_account_address(&token.issuer) {
            return Err(ChainError::Config(format!(
                "genesis token {} has invalid issuer {}",
                token.address, token.issuer
            )));
        }
        if !registered.insert(token.address.clone()) {
            return Err(ChainError::Config(format!(
                "genesis token {} listed twice",
                token.address
            )));
        }
        let mut issuer = state
            .account(&token.issuer)?
            .unwrap_or_else(|| Account::new(token.issuer.clone()));
        issuer.credit(&token.address, token.total);
        state.store_account(&issuer)?;
        tokens.store_token(&token)?;
    }
    Ok(Header::genesis(state.root_hex(), tokens.root_hex()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenesisAccount, GenesisToken};
    use crate::types::GAS_TOKEN;
    use crate::crypto::{address_from_public_key, generate_keypair};

    #[test]
    fn chain_state_recovers_last_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: "aa".repeat(32),
                amount: 500,
                gas: 50,
            }],
            tokens: Vec::new(),
        };
        let first = {
            let storage = Storage::open(dir.path()).expect("open");
            let chain = ChainState::open(1, storage, &genesis, Round::new(Vec::new()), 16).expect("chain");
            assert_eq!(chain.account(&"aa".repeat(32)).expect("read").expect("funded").amount, 500);
            chain.last_header()
        };
        let storage = Storage::open(dir.path()).expect("reopen");
        let chain = ChainState::open(1, storage, &GenesisConfig::default(), Round::new(Vec::new()), 16).expect("chain");
        assert_eq!(chain.last_header(), first);
        assert_eq!(chain.last_height(), 0);
    }

    #[test]
    fn new_transaction_checks_fields_and_nonce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keypair = generate_keypair();
        let sender = address_from_public_key(&keypair.public);
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: sender.clone(),
                amount: 100,
                gas: 10,
            }],
            tokens: Vec::new(),
        };
        let storage = Storage::open(dir.path()).expect("open");
        let chain = ChainState::open(1, storage, &genesis, Round::new(Vec::new()), 16).expect("chain");
        let to = "bb".repeat(32);

        let negative = Transaction::signed(&keypair, to.clone(), 1, -5, 1, 1, String::new(), String::new());
        assert!(matches!(chain.new_transaction(negative), Err(ChainError::Transaction(_))));

        let good = Transaction::signed(&keypair, to.clone(), 1, 5, 1, 1, String::new(), String::new());
        let id = chain.new_transaction(good.clone()).expect("admitted");
        assert_eq!(id, good.id());
        assert!(chain.pool().contains(&id));
        assert_eq!(chain.storage().read_transaction(&id).expect("read"), Some(good.clone()));
        assert!(chain.new_transaction(good).is_err());
        assert_eq!(chain.pool().pop(10).len(), 1);
    }

    fn ticket(issuer: &str) -> GenesisToken {
        GenesisToken {
            address: "ab".repeat(32),
            name: "Ticket".into(),
            decimals: 2,
            total: 1_000,
            issuer: issuer.to_string(),
        }
    }

    #[test]
    fn genesis_tokens_are_registered_and_issued() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keypair = generate_keypair();
        let issuer = address_from_public_key(&keypair.public);
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: issuer.clone(),
                amount: 100,
                gas: 10,
            }],
            tokens: vec![ticket(&issuer)],
        };
        let storage = Storage::open(dir.path()).expect("open");
        let chain = ChainState::open(1, storage, &genesis, Round::new(Vec::new()), 16).expect("chain");

        let token = chain.token(&"ab".repeat(32)).expect("read").expect("registered");
        assert_eq!(token.total, 1_000);
        assert_eq!(token.issuer, issuer);
        let account = chain.account(&issuer).expect("read").expect("issuer");
        assert_eq!(account.balance_of(&"ab".repeat(32)), 1_000);
        assert_eq!(account.amount, 100);
        assert_ne!(chain.last_header().token_root, StateTree::empty(chain.nodes.clone()).root_hex());

        // The same genesis always seals the same token root.
        let other = tempfile::tempdir().expect("tempdir");
        let replica = ChainState::open(1, Storage::open(other.path()).expect("open"), &genesis, Round::new(Vec::new()), 16)
            .expect("chain");
        assert_eq!(replica.last_header().token_root, chain.last_header().token_root);
        assert_eq!(replica.last_header(), chain.last_header());
    }

    #[test]
    fn malformed_genesis_tokens_are_refused() {
        let issuer = "cc".repeat(32);
        let cases = [
            GenesisToken { decimals: 0, ..ticket(&issuer) },
            GenesisToken { issuer: "c".into(), ..ticket(&issuer) },
            GenesisToken { address: GAS_TOKEN.into(), ..ticket(&issuer) },
        ];
        for token in cases {
            let dir = tempfile::tempdir().expect("tempdir");
            let genesis = GenesisConfig { accounts: Vec::new(), tokens: vec![token] };
            let storage = Storage::open(dir.path()).expect("open");
            let opened = ChainState::open(1, storage, &genesis, Round::new(Vec::new()), 16);
            assert!(matches!(opened, Err(ChainError::Config(_))));
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = GenesisConfig {
            accounts: Vec::new(),
            tokens: vec![ticket(&issuer), ticket(&issuer)],
        };
        let opened = ChainState::open(1, Storage::open(dir.path()).expect("open"), &genesis, Round::new(Vec::new()), 16);
        assert!(matches!(opened, Err(ChainError::Config(_))));
    }

    #[test]
    fn admission_requires_a_registered_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keypair = generate_keypair();
        let sender = address_from_public_key(&keypair.public);
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: sender.clone(),
                amount: 100,
                gas: 10,
            }],
            tokens: vec![ticket(&sender)],
        };
        let storage = Storage::open(dir.path()).expect("open");
        let chain = ChainState::open(1, storage, &genesis, Round::new(Vec::new()), 16).expect("chain");
        let to = "bb".repeat(32);

        let unknown = Transaction::signed(&keypair, to.clone(), 1, 5, 1, 1, String::new(), "cd".repeat(32));
        let id = unknown.id();
        match chain.new_transaction(unknown) {
            Err(ChainError::Transaction(reason)) => assert!(reason.contains("not registered")),
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert!(!chain.pool().contains(&id));
        assert_eq!(chain.storage().read_transaction(&id).expect("read"), None);

        let ticket_transfer = Transaction::signed(&keypair, to.clone(), 1, 5, 1, 1, String::new(), "ab".repeat(32));
        chain.new_transaction(ticket_transfer).expect("registered token admitted");
        let gas_transfer = Transaction::signed(&keypair, to, 2, 5, 1, 2, String::new(), GAS_TOKEN.into());
        chain.new_transaction(gas_transfer).expect("gas is always registered");
    }
}
