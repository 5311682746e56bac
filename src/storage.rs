use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::errors::{ChainError, ChainResult};
use crate::state::NodeStore;
use crate::types::{encode_set, BlobSource, Block, BlockVote, Header, Transaction, TransactionReceipt};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_STATE: &str = "state";
const CF_BLOBS: &str = "blobs";
const CF_CHAIN: &str = "chain";
const CF_METADATA: &str = "metadata";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

fn votes_key(block_hash: &str) -> String {
    format!("block_votes:{block_hash}")
}

fn last_header_key(chain_id: u64) -> String {
    format!("lastHeader_{chain_id}")
}

fn header_by_height_key(chain_id: u64, height: u64) -> String {
    format!("headerByHeight_{chain_id}_{height}")
}

fn block_by_height_key(chain_id: u64, height: u64) -> String {
    format!("blockByHeight_{chain_id}_{height}")
}

fn block_key(block_hash: &str) -> String {
    format!("block:{block_hash}")
}

fn receipt_key(tx_id: &str) -> String {
    format!("receipt:{tx_id}")
}

/// Persistent node state.
///
/// `state` holds trie nodes and `blobs` holds content-addressed bytes (headers,
/// transaction and receipt sets, single transactions), both keyed by their
/// sha3 digest. `chain` holds named pointers and per-block records.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOBS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHAIN, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing {name} column family")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not supported (expected {STORAGE_SCHEMA_VERSION})"
                    )));
                }
                Ok(())
            }
            None => {
                if !self.is_empty()? {
                    return Err(ChainError::Config(
                        "database has data but no schema version".into(),
                    ));
                }
                self.db.put_cf(
                    &metadata_cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    fn is_empty(&self) -> ChainResult<bool> {
        for name in [CF_STATE, CF_BLOBS, CF_CHAIN] {
            let cf = self.cf(name)?;
            let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
            if iter.next().transpose()?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn get_chain_record(&self, key: &str) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_CHAIN)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    pub fn put_blob(&self, hash: &str, bytes: &[u8]) -> ChainResult<()> {
        let cf = self.cf(CF_BLOBS)?;
        self.db.put_cf(&cf, hash.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_BLOBS)?;
        Ok(self.db.get_cf(&cf, hash.as_bytes())?)
    }

    pub fn store_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        self.put_blob(&tx.id(), &tx.to_bytes())
    }

    pub fn read_transaction(&self, tx_id: &str) -> ChainResult<Option<Transaction>> {
        match self.get_blob(tx_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores the serialized transaction and receipt sets under their set hashes.
    pub fn store_body(
        &self,
        transactions: &[Transaction],
        receipts: &[TransactionReceipt],
    ) -> ChainResult<(String, String)> {
        let (tx_hash, tx_bytes) = encode_set(transactions);
        let (receipt_hash, receipt_bytes) = encode_set(receipts);
        self.put_blob(&tx_hash, &tx_bytes)?;
        self.put_blob(&receipt_hash, &receipt_bytes)?;
        Ok((tx_hash, receipt_hash))
    }

    pub fn read_header(&self, hash: &str) -> ChainResult<Option<Header>> {
        match self.get_blob(hash)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn header_by_height(&self, chain_id: u64, height: u64) -> ChainResult<Option<Header>> {
        match self.get_chain_record(&header_by_height_key(chain_id, height))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn last_header(&self, chain_id: u64) -> ChainResult<Option<Header>> {
        match self.get_chain_record(&last_header_key(chain_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_by_hash(&self, hash: &str) -> ChainResult<Option<Block>> {
        match self.get_chain_record(&block_key(hash))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_by_height(&self, chain_id: u64, height: u64) -> ChainResult<Option<Block>> {
        match self.get_chain_record(&block_by_height_key(chain_id, height))? {
            Some(hash) => {
                let hash = String::from_utf8(hash)
                    .map_err(|err| ChainError::Config(format!("invalid block pointer: {err}")))?;
                self.block_by_hash(&hash)
            }
            None => Ok(None),
        }
    }

    pub fn votes(&self, block_hash: &str) -> ChainResult<Vec<BlockVote>> {
        match self.get_chain_record(&votes_key(block_hash))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn receipt(&self, tx_id: &str) -> ChainResult<Option<TransactionReceipt>> {
        match self.get_chain_record(&receipt_key(tx_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes the genesis header as height 0 and as the last header.
    pub fn store_genesis(&self, chain_id: u64, header: &Header) -> ChainResult<()> {
        let chain_cf = self.cf(CF_CHAIN)?;
        let blobs_cf = self.cf(CF_BLOBS)?;
        let header_bytes = serde_json::to_vec(header)?;
        let (empty_hash, empty_bytes) = encode_set::<Transaction>(&[]);
        let mut batch = WriteBatch::default();
        batch.put_cf(&blobs_cf, header.hash().as_bytes(), header.canonical_bytes());
        batch.put_cf(&blobs_cf, empty_hash.as_bytes(), empty_bytes);
        batch.put_cf(
            &chain_cf,
            header_by_height_key(chain_id, header.height).as_bytes(),
            &header_bytes,
        );
        batch.put_cf(&chain_cf, last_header_key(chain_id).as_bytes(), &header_bytes);
        self.db.write(batch)?;
        Ok(())
    }

    /// Persists a committed block atomically: votes, block and header by
    /// height and by hash, receipts by transaction id and the last-header pointer.
    pub fn commit_block(&self, chain_id: u64, block: &Block, votes: &[BlockVote]) -> ChainResult<()> {
        let chain_cf = self.cf(CF_CHAIN)?;
        let blobs_cf = self.cf(CF_BLOBS)?;
        let header = &block.header;
        let header_bytes = serde_json::to_vec(header)?;
        let transactions = block.transactions()?;
        let receipts = block.receipts()?;
        let (tx_hash, tx_bytes) = encode_set(transactions);
        let (receipt_hash, receipt_bytes) = encode_set(receipts);

        let mut batch = WriteBatch::default();
        batch.put_cf(&chain_cf, votes_key(&block.hash).as_bytes(), bincode::serialize(votes)?);
        batch.put_cf(&blobs_cf, block.hash.as_bytes(), header.canonical_bytes());
        batch.put_cf(&blobs_cf, tx_hash.as_bytes(), tx_bytes);
        batch.put_cf(&blobs_cf, receipt_hash.as_bytes(), receipt_bytes);
        for tx in transactions {
            batch.put_cf(&blobs_cf, tx.id().as_bytes(), tx.to_bytes());
        }
        for receipt in receipts {
            batch.put_cf(
                &chain_cf,
                receipt_key(&receipt.tx_id).as_bytes(),
                serde_json::to_vec(receipt)?,
            );
        }
        batch.put_cf(&chain_cf, block_key(&block.hash).as_bytes(), serde_json::to_vec(block)?);
        batch.put_cf(
            &chain_cf,
            block_by_height_key(chain_id, header.height).as_bytes(),
            block.hash.as_bytes(),
        );
        batch.put_cf(
            &chain_cf,
            header_by_height_key(chain_id, header.height).as_bytes(),
            &header_bytes,
        );
        batch.put_cf(&chain_cf, last_header_key(chain_id).as_bytes(), &header_bytes);
        self.db.write(batch)?;
        Ok(())
    }
}

impl NodeStore for Storage {
    fn load_node(&self, hash: &[u8; 32]) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_STATE)?;
        Ok(self.db.get_cf(&cf, hash)?)
    }

    fn store_node(&self, hash: &[u8; 32], bytes: &[u8]) -> ChainResult<()> {
        let cf = self.cf(CF_STATE)?;
        self.db.put_cf(&cf, hash, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl BlobSource for Storage {
    async fn fetch_blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        self.get_blob(hash)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}
