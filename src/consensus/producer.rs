use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::client::Outbound;
use crate::errors::ChainResult;
use crate::execution::BlockBuilder;
use crate::status::BlockStatus;
use crate::types::{now_millis, Block};

use super::Dbft;

/// Clears the scheduling flag when the loop exits, including by panic.
struct ScheduleGuard<'a>(&'a AtomicBool);

impl Drop for ScheduleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Dbft {
    /// Proposes a block every time this node's slot comes up.
    ///
    /// Only one schedule runs per engine; a second call returns at once.
    pub async fn try_pack(self: Arc<Self>) -> ChainResult<()> {
        if self.scheduling.swap(true, Ordering::SeqCst) {
            debug!("proposal schedule already running");
            return Ok(());
        }
        let _guard = ScheduleGuard(&self.scheduling);
        let interval = self.settings.interval_ms;
        loop {
            let last = self.chain.last_header();
            let now = now_millis();
            // A slot that opened less than a margin ago is still worth taking.
            let not_before = now.saturating_sub(self.settings.pack_margin_ms);
            let slot = self
                .chain
                .round()
                .next_slot(&last, &self.me.account, not_before, interval);
            let Some(slot) = slot else {
                self.chain
                    .wait_for_commit(Duration::from_millis(interval))
                    .await;
                continue;
            };
            if slot > now {
                let wait = (slot - now).min(interval);
                self.chain.wait_for_commit(Duration::from_millis(wait)).await;
                continue;
            }

            match self.pack(slot).await {
                Ok(Some(block)) => debug!(height = block.header.height, "proposal sent"),
                Ok(None) => {}
                Err(err) => error!(height = last.height + 1, %err, "block assembly abandoned"),
            }
            if self.chain.last_height() == last.height {
                self.chain
                    .wait_for_commit(Duration::from_millis(interval))
                    .await;
            }
        }
    }

    /// Builds, seals and broadcasts a block on the last header with timestamp `target`.
    ///
    /// Returns `None` if this height was already attempted within the last
    /// interval or the chain moved on while transactions were being drained.
    pub async fn pack(&self, target: u64) -> ChainResult<Option<Block>> {
        let parent = self.chain.last_header();
        let height = parent.height + 1;
        let interval = self.settings.interval_ms;
        if !self
            .chain
            .statuses()
            .try_begin_pack(height, now_millis(), interval)
        {
            debug!(height, "height already attempted in this window");
            return Ok(None);
        }

        let deadline = (target + interval).saturating_sub(self.settings.pack_margin_ms);
        let mut builder = BlockBuilder::new(
            &parent,
            self.me.account.clone(),
            target,
            self.chain.node_store(),
            self.executor.clone(),
            self.settings.contract_timeout,
        )?;
        loop {
            let now = now_millis();
            if now >= deadline {
                break;
            }
            let batch = self.chain.pool().pop(self.settings.drain_batch_size);
            if batch.is_empty() {
                self.chain
                    .pool()
                    .wait_ready(Duration::from_millis(deadline - now))
                    .await;
                continue;
            }
            for tx in batch {
                builder.apply(tx).await?;
            }
        }

        if self.chain.last_height() != parent.height {
            debug!(height, "chain advanced while packing; proposal dropped");
            return Ok(None);
        }
        let built = builder.finalize()?;
        self.chain
            .storage()
            .store_body(&built.transactions, &built.receipts)?;
        let block = Block::seal(
            built.header,
            self.me.clone(),
            &self.keypair,
            built.transactions,
            built.receipts,
        );
        self.chain
            .statuses()
            .set_status(&block.hash, height, BlockStatus::Valid);
        self.chain.statuses().cache_block(block.clone());
        info!(
            height,
            hash = %block.hash,
            txs = block.transactions.as_ref().map_or(0, Vec::len),
            "proposing block"
        );
        // Peers fetch the body by its set hashes.
        self.broadcast(Outbound::Block(block.without_body()));
        Ok(Some(block))
    }
}
