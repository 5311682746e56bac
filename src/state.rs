//! Content-addressed ledger store.
//!
//! Accounts, and registered tokens in a separate tree, live in a radix trie
//! over the raw address bytes. Every node is stored under the sha3 digest of
//! its encoding, so an insert only writes the nodes on the path to the key
//! and any earlier root stays readable. A subtree
//! that holds a single key is always a leaf, which makes the root a function of
//! the key/value set alone, independent of insertion order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::sha3_256;
use crate::errors::{ChainError, ChainResult};
use crate::types::{address_len, is_builtin_token, Account, Token, ACCOUNT_ADDRESS_LENGTH};

pub type Hash = [u8; 32];

/// Backing store for trie nodes.
pub trait NodeStore: Send + Sync {
    fn load_node(&self, hash: &Hash) -> ChainResult<Option<Vec<u8>>>;
    fn store_node(&self, hash: &Hash, bytes: &[u8]) -> ChainResult<()>;
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn load_node(&self, hash: &Hash) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.nodes.read().get(hash).cloned())
    }

    fn store_node(&self, hash: &Hash, bytes: &[u8]) -> ChainResult<()> {
        self.nodes.write().insert(*hash, bytes.to_vec());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum TrieNode {
    Leaf {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Branch {
        value: Option<Vec<u8>>,
        children: BTreeMap<u8, Hash>,
    },
}

fn encode_node(node: &TrieNode) -> ChainResult<(Hash, Vec<u8>)> {
    let bytes = bincode::serialize(node)?;
    Ok((sha3_256(&bytes), bytes))
}

/// Root of the trie with no keys.
pub fn empty_root() -> Hash {
    let empty = TrieNode::Branch {
        value: None,
        children: BTreeMap::new(),
    };
    let bytes = bincode::serialize(&empty).expect("serializing empty trie node");
    sha3_256(&bytes)
}

pub fn root_to_hex(root: &Hash) -> String {
    hex::encode(root)
}

pub fn root_from_hex(root: &str) -> ChainResult<Hash> {
    let bytes = hex::decode(root)
        .map_err(|err| ChainError::Block(format!("invalid state root {root}: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Block(format!("state root {root} is not 32 bytes")))
}

/// A view of the ledger at one root. Inserting moves the view to the new root.
#[derive(Clone)]
pub struct StateTree {
    store: Arc<dyn NodeStore>,
    root: Hash,
}

impl StateTree {
    pub fn empty(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            root: empty_root(),
        }
    }

    pub fn at(store: Arc<dyn NodeStore>, root: Hash) -> Self {
        Self { store, root }
    }

    pub fn at_hex(store: Arc<dyn NodeStore>, root: &str) -> ChainResult<Self> {
        Ok(Self::at(store, root_from_hex(root)?))
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn root_hex(&self) -> String {
        root_to_hex(&self.root)
    }

    fn load(&self, hash: &Hash) -> ChainResult<TrieNode> {
        let bytes = self.store.load_node(hash)?.ok_or_else(|| {
            ChainError::Config(format!("missing state node {}", hex::encode(hash)))
        })?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn save(&self, node: &TrieNode) -> ChainResult<Hash> {
        let (hash, bytes) = encode_node(node)?;
        self.store.store_node(&hash, &bytes)?;
        Ok(hash)
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        if self.root == empty_root() {
            return Ok(None);
        }
        let mut current = self.root;
        let mut depth = 0;
        loop {
            match self.load(&current)? {
                TrieNode::Leaf { key: stored, value } => {
                    return Ok((stored == key).then_some(value));
                }
                TrieNode::Branch { value, children } => {
                    if depth == key.len() {
                        return Ok(value);
                    }
                    match children.get(&key[depth]) {
                        Some(child) => {
                            current = *child;
                            depth += 1;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> ChainResult<Hash> {
        let start = (self.root != empty_root()).then_some(self.root);
        self.root = self.insert_at(start, 0, key, value)?;
        Ok(self.root)
    }

    fn insert_at(
        &self,
        node: Option<Hash>,
        depth: usize,
        key: &[u8],
        value: &[u8],
    ) -> ChainResult<Hash> {
        let Some(hash) = node else {
            return self.save(&TrieNode::Leaf {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        };
        match self.load(&hash)? {
            TrieNode::Leaf {
                key: existing,
                value: existing_value,
            } => {
                if existing == key {
                    return self.save(&TrieNode::Leaf {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                }
                // Push the existing leaf one level down, then place the new key.
                let mut children = BTreeMap::new();
                let branch_value = if depth == existing.len() {
                    Some(existing_value)
                } else {
                    children.insert(existing[depth], hash);
                    None
                };
                self.insert_into_branch(branch_value, children, depth, key, value)
            }
            TrieNode::Branch {
                value: branch_value,
                children,
            } => self.insert_into_branch(branch_value, children, depth, key, value),
        }
    }

    fn insert_into_branch(
        &self,
        mut branch_value: Option<Vec<u8>>,
        mut children: BTreeMap<u8, Hash>,
        depth: usize,
        key: &[u8],
        value: &[u8],
    ) -> ChainResult<Hash> {
        if depth == key.len() {
            branch_value = Some(value.to_vec());
        } else {
            let slot = key[depth];
            let child = children.get(&slot).copied();
            let updated = self.insert_at(child, depth + 1, key, value)?;
            children.insert(slot, updated);
        }
        self.save(&TrieNode::Branch {
            value: branch_value,
            children,
        })
    }

    pub fn account(&self, address: &str) -> ChainResult<Option<Account>> {
        let key = account_key(address)?;
        match self.get(&key)? {
            Some(bytes) => Ok(Some(Account::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_account(&mut self, account: &Account) -> ChainResult<Hash> {
        let key = account_key(&account.address)?;
        self.insert(&key, &account.to_bytes()?)
    }

    pub fn token(&self, address: &str) -> ChainResult<Option<Token>> {
        let key = account_key(address)?;
        match self.get(&key)? {
            Some(bytes) => Ok(Some(Token::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_token(&mut self, token: &Token) -> ChainResult<Hash> {
        let key = account_key(&token.address)?;
        self.insert(&key, &token.to_bytes()?)
    }

    /// Whether `token_address` may be moved: a builtin token, or a
    /// well-formed entry in this token tree.
    pub fn is_registered_token(&self, token_address: &str) -> ChainResult<bool> {
        if is_builtin_token(token_address) {
            return Ok(true);
        }
        if address_len(token_address) != Some(ACCOUNT_ADDRESS_LENGTH) {
            return Ok(false);
        }
        Ok(self
            .token(token_address)?
            .map_or(false, |token| token.is_well_formed() && token.address == token_address))
    }
}

fn account_key(address: &str) -> ChainResult<Vec<u8>> {
    hex::decode(address)
        .map_err(|err| ChainError::Transaction(format!("invalid address {address}: {err}")))
}
