//! Pending transaction pool.
//!
//! Transactions are bucketed per sender and ordered by nonce. Only a run of
//! nonces that continues the sender's confirmed nonce without gaps is handed to
//! the ready queue, which the producer drains in FIFO order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Transaction};

/// Per-sender bucket.
#[derive(Clone, Debug)]
pub struct UserTxs {
    confirmed_nonce: u64,
    /// Highest nonce already handed to the ready queue.
    cursor: u64,
    txs: BTreeMap<u64, (u64, Transaction)>,
}

impl UserTxs {
    pub fn new(confirmed_nonce: u64) -> Self {
        Self {
            confirmed_nonce,
            cursor: confirmed_nonce,
            txs: BTreeMap::new(),
        }
    }

    pub fn confirmed_nonce(&self) -> u64 {
        self.confirmed_nonce
    }

    /// Highest nonce known for the sender, pending or confirmed.
    pub fn pending_nonce(&self) -> u64 {
        self.txs
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.confirmed_nonce)
            .max(self.confirmed_nonce)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains_nonce(&self, nonce: u64) -> bool {
        self.txs.contains_key(&nonce)
    }

    fn insert(&mut self, seq: u64, tx: Transaction) {
        self.txs.insert(tx.nonce, (seq, tx));
    }

    /// Advances the cursor over the gap-free run after it and returns that run.
    fn take_promotable(&mut self) -> Vec<(u64, Transaction)> {
        let mut run = Vec::new();
        while let Some((seq, tx)) = self.txs.get(&(self.cursor + 1)) {
            run.push((*seq, tx.clone()));
            self.cursor += 1;
        }
        run
    }

    /// Drops everything at or below `nonce` and returns the removed transactions.
    fn confirm(&mut self, nonce: u64) -> Vec<Transaction> {
        if nonce <= self.confirmed_nonce {
            return Vec::new();
        }
        self.confirmed_nonce = nonce;
        let retained = self.txs.split_off(&(nonce + 1));
        let removed = std::mem::replace(&mut self.txs, retained);
        removed.into_values().map(|(_, tx)| tx).collect()
    }

    /// Drops the pooled entry for `tx`'s nonce if it is `tx` itself.
    fn remove(&mut self, tx: &Transaction) -> Option<Transaction> {
        let pooled = self.txs.get(&tx.nonce)?;
        if pooled.1 != *tx {
            return None;
        }
        self.txs.remove(&tx.nonce).map(|(_, tx)| tx)
    }

    fn reset_cursor(&mut self) {
        self.cursor = self.confirmed_nonce;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.txs.values().map(|(_, tx)| tx.clone()).collect()
    }
}

#[derive(Default)]
struct Buckets {
    all: HashSet<String>,
    users: HashMap<Address, UserTxs>,
    next_seq: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStatus {
    pub pending: usize,
    pub ready: usize,
    pub senders: usize,
}

pub struct TxPool {
    buckets: RwLock<Buckets>,
    ready: Mutex<VecDeque<Transaction>>,
    ready_signal: Notify,
    limit: usize,
}

impl TxPool {
    pub fn new(limit: usize) -> Self {
        Self {
            buckets: RwLock::new(Buckets::default()),
            ready: Mutex::new(VecDeque::new()),
            ready_signal: Notify::new(),
            limit,
        }
    }

    /// Records `tx` and promotes any run it completes.
    ///
    /// Returns `true` if the transaction reached the ready queue.
    pub fn park(&self, tx: Transaction, confirmed_nonce: u64) -> ChainResult<bool> {
        let id = tx.id();
        let mut buckets = self.buckets.write();
        if buckets.all.contains(&id) {
            return Err(ChainError::Transaction("transaction already pooled".into()));
        }
        if buckets.all.len() >= self.limit {
            return Err(ChainError::Transaction("transaction pool full".into()));
        }
        if tx.nonce <= confirmed_nonce {
            return Err(ChainError::Transaction(format!(
                "nonce {} already confirmed (account nonce {confirmed_nonce})",
                tx.nonce
            )));
        }

        let seq = buckets.next_seq;
        buckets.next_seq += 1;
        let bucket = buckets
            .users
            .entry(tx.from.clone())
            .or_insert_with(|| UserTxs::new(confirmed_nonce));
        let stale = bucket.confirm(confirmed_nonce);
        if bucket.contains_nonce(tx.nonce) {
            return Err(ChainError::Transaction(format!(
                "nonce {} already pooled for {}",
                tx.nonce, tx.from
            )));
        }
        bucket.insert(seq, tx);
        let promoted = bucket.take_promotable();
        for tx in &stale {
            buckets.all.remove(&tx.id());
        }
        buckets.all.insert(id.clone());

        let reached_ready = promoted.iter().any(|(_, tx)| tx.id() == id);
        if !promoted.is_empty() {
            let mut ready = self.ready.lock();
            ready.extend(promoted.into_iter().map(|(_, tx)| tx));
            drop(ready);
            self.ready_signal.notify_one();
        }
        debug!(tx = %id, ready = reached_ready, "transaction parked");
        Ok(reached_ready)
    }

    /// Removes up to `n` ready transactions in arrival order.
    pub fn pop(&self, n: usize) -> Vec<Transaction> {
        let mut ready = self.ready.lock();
        let take = n.min(ready.len());
        ready.drain(..take).collect()
    }

    /// Waits until a ready transaction may be available or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        if !self.ready.lock().is_empty() {
            return true;
        }
        tokio::time::timeout(timeout, self.ready_signal.notified())
            .await
            .is_ok()
    }

    /// Reconciles the pool with a committed block.
    ///
    /// `committed` is the block's transaction list and `confirmed` maps each of
    /// its senders to the account nonce after the block. Committed and stale
    /// entries are dropped, and the ready queue is rebuilt from every bucket
    /// so that runs unblocked by the commit are promoted and transactions
    /// popped into an uncommitted block are offered again.
    pub fn notify(&self, committed: &[Transaction], confirmed: &HashMap<Address, u64>) {
        let mut buckets = self.buckets.write();
        let mut removed = Vec::new();
        for tx in committed {
            if let Some(bucket) = buckets.users.get_mut(&tx.from) {
                removed.extend(bucket.remove(tx));
            }
        }
        for (sender, nonce) in confirmed {
            if let Some(bucket) = buckets.users.get_mut(sender) {
                removed.extend(bucket.confirm(*nonce));
            }
        }
        for tx in committed.iter().chain(removed.iter()) {
            buckets.all.remove(&tx.id());
        }
        buckets.users.retain(|_, bucket| !bucket.is_empty());

        let mut promoted = Vec::new();
        for bucket in buckets.users.values_mut() {
            bucket.reset_cursor();
            promoted.extend(bucket.take_promotable());
        }
        promoted.sort_by_key(|(seq, _)| *seq);

        let mut ready = self.ready.lock();
        *ready = promoted.into_iter().map(|(_, tx)| tx).collect();
        let has_ready = !ready.is_empty();
        drop(ready);
        if has_ready {
            self.ready_signal.notify_one();
        }
        debug!(committed = committed.len(), pending = buckets.all.len(), "pool reconciled");
    }

    pub fn user_txs(&self, address: &str) -> Option<UserTxs> {
        self.buckets.read().users.get(address).cloned()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.buckets.read().all.contains(tx_id)
    }

    pub fn status(&self) -> PoolStatus {
        let buckets = self.buckets.read();
        PoolStatus {
            pending: buckets.all.len(),
            ready: self.ready.lock().len(),
            senders: buckets.users.len(),
        }
    }
}
