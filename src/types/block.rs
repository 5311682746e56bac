use async_trait::async_trait;
use ed25519_dalek::Keypair;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{sha3_hex, sign_message, signature_to_hex, verify_signer};
use crate::errors::{ChainError, ChainResult};

use super::{Address, Peer, Transaction, TransactionReceipt};

pub const BLOCK_VERSION: u32 = 1;

/// Field order is part of the hash; do not reorder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub height: u64,
    pub timestamp: u64,
    pub total_fee: i64,
    pub previous_hash: String,
    pub coinbase: Address,
    pub state_root: String,
    pub token_root: String,
    pub tx_set_hash: String,
    pub receipt_set_hash: String,
    pub version: u32,
}

impl Header {
    pub fn genesis(state_root: String, token_root: String) -> Self {
        let (empty_set, _) = encode_set::<Transaction>(&[]);
        Self {
            height: 0,
            timestamp: 0,
            total_fee: 0,
            previous_hash: String::new(),
            coinbase: String::new(),
            state_root,
            token_root,
            tx_set_hash: empty_set.clone(),
            receipt_set_hash: empty_set,
            version: BLOCK_VERSION,
        }
    }

    /// Starts the successor header; roots are carried over until transactions are applied.
    pub fn next(&self, coinbase: Address, timestamp: u64) -> Self {
        let (empty_set, _) = encode_set::<Transaction>(&[]);
        Self {
            height: self.height + 1,
            timestamp,
            total_fee: 0,
            previous_hash: self.hash(),
            coinbase,
            state_root: self.state_root.clone(),
            token_root: self.token_root.clone(),
            tx_set_hash: empty_set.clone(),
            receipt_set_hash: empty_set,
            version: BLOCK_VERSION,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block header")
    }

    pub fn hash(&self) -> String {
        sha3_hex(&self.canonical_bytes())
    }

    pub fn is_child_of(&self, parent: &Header) -> bool {
        self.height == parent.height + 1 && self.previous_hash == parent.hash()
    }
}

/// Serializes a transaction or receipt list and returns its content hash with the bytes.
pub fn encode_set<T: Serialize>(items: &[T]) -> (String, Vec<u8>) {
    let bytes = serde_json::to_vec(items).expect("serializing block body");
    (sha3_hex(&bytes), bytes)
}

fn decode_set<T: DeserializeOwned>(expected: &str, bytes: &[u8]) -> ChainResult<Vec<T>> {
    let actual = sha3_hex(bytes);
    if actual != expected {
        return Err(ChainError::Block(format!(
            "body hash mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Content-addressed byte store a block body can be fetched from.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch_blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub hash: String,
    pub signature: String,
    pub public_key: String,
    pub miner: Peer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<Transaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipts: Option<Vec<TransactionReceipt>>,
}

impl Block {
    pub fn seal(
        header: Header,
        miner: Peer,
        keypair: &Keypair,
        transactions: Vec<Transaction>,
        receipts: Vec<TransactionReceipt>,
    ) -> Self {
        let hash = header.hash();
        let signature = signature_to_hex(&sign_message(keypair, hash.as_bytes()));
        Self {
            header,
            hash,
            signature,
            public_key: hex::encode(keypair.public.to_bytes()),
            miner,
            transactions: Some(transactions),
            receipts: Some(receipts),
        }
    }

    /// Checks the hash, the proposer signature and that the miner is the coinbase.
    pub fn verify_seal(&self) -> ChainResult<()> {
        let expected = self.header.hash();
        if self.hash != expected {
            return Err(ChainError::Block(format!(
                "block hash {} does not match header hash {expected}",
                self.hash
            )));
        }
        if self.miner.account != self.header.coinbase {
            return Err(ChainError::Block("miner is not the header coinbase".into()));
        }
        verify_signer(
            &self.header.coinbase,
            &self.public_key,
            self.hash.as_bytes(),
            &self.signature,
        )
    }

    pub fn has_body(&self) -> bool {
        self.transactions.is_some() && self.receipts.is_some()
    }

    /// Fills in missing transactions and receipts from `source`.
    ///
    /// Resident lists are trusted only if they hash to the header's set hashes.
    pub async fn load_body(&mut self, source: &dyn BlobSource) -> ChainResult<()> {
        match &self.transactions {
            Some(transactions) => {
                if encode_set(transactions).0 != self.header.tx_set_hash {
                    return Err(ChainError::Block("transaction set hash mismatch".into()));
                }
            }
            None => {
                let bytes = source
                    .fetch_blob(&self.header.tx_set_hash)
                    .await?
                    .ok_or_else(|| ChainError::Block("transaction set not found".into()))?;
                self.transactions = Some(decode_set(&self.header.tx_set_hash, &bytes)?);
            }
        }
        match &self.receipts {
            Some(receipts) => {
                if encode_set(receipts).0 != self.header.receipt_set_hash {
                    return Err(ChainError::Block("receipt set hash mismatch".into()));
                }
            }
            None => {
                let bytes = source
                    .fetch_blob(&self.header.receipt_set_hash)
                    .await?
                    .ok_or_else(|| ChainError::Block("receipt set not found".into()))?;
                self.receipts = Some(decode_set(&self.header.receipt_set_hash, &bytes)?);
            }
        }
        Ok(())
    }

    pub fn transactions(&self) -> ChainResult<&[Transaction]> {
        self.transactions
            .as_deref()
            .ok_or_else(|| ChainError::Block("block body not loaded".into()))
    }

    pub fn receipts(&self) -> ChainResult<&[TransactionReceipt]> {
        self.receipts
            .as_deref()
            .ok_or_else(|| ChainError::Block("block body not loaded".into()))
    }

    pub fn without_body(&self) -> Self {
        Self {
            transactions: None,
            receipts: None,
            ..self.clone()
        }
    }
}
