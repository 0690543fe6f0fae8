//! Block admission.
//!
//! A block moves through: hash check, duplicate check, parent lookup, weight
//! pre-check, consensus, body limits, tx recovery (no locks held), then the
//! decision under `mu`: extend, reject, or reset to the parent and extend.

use log::{debug, info, warn};

use super::block::{receipt_tree, tx_tree, Block};
use super::{AddBlockResult, AdmissionError, BlockChain, ChainTop, ConsensusError, FutureBlock};
use crate::mempool::PoolError;
use crate::p2p::PeerId;
use crate::state::ExecuteOutput;
use crate::tx::Transaction;

impl BlockChain {
    /// Offers one block. Never blocks on network work: a block whose parent
    /// is unknown is parked and fork processing or sync is handed off.
    pub fn add_block(&self, source: Option<&PeerId>, block: Block) -> AddBlockResult {
        let hash = block.hash();
        let height = block.height();
        match self.try_add_block(source, block) {
            Ok(result) => {
                debug!("[chain] block {} at {}: {:?}", hash.short(), height, result);
                result
            }
            Err(e) => {
                warn!("[chain] block {} at {} rejected: {}", hash.short(), height, e);
                e.result()
            }
        }
    }

    fn try_add_block(&self, source: Option<&PeerId>, mut block: Block) -> Result<AddBlockResult, AdmissionError> {
        let computed = block.header.compute_hash();
        if computed != block.header.hash {
            return Err(AdmissionError::HashMismatch {
                declared: block.header.hash,
                computed,
            });
        }
        if self.store.has_block(&block.hash())? {
            return Ok(AddBlockResult::AlreadyExists);
        }
        let parent = match self.store.header_by_hash(&block.pre_hash())? {
            Some(p) => p,
            None => {
                self.park_orphan(source, block);
                return Ok(AddBlockResult::ParentMissing);
            }
        };

        if self.top().weight() > block.header.weight() {
            return Ok(AddBlockResult::LocalHeavier);
        }

        if let Err(e) = self.consensus.verify_new_block(&block.header, &parent) {
            if let ConsensusError::MissingGroup(group) = &e {
                info!("[chain] block {} needs unknown group {}", block.hash().short(), group.short());
                if let Some(handler) = self.orphan_handler() {
                    handler.on_group_missing(source.cloned());
                }
            }
            return Err(e.into());
        }

        self.check_body_limits(&block)?;
        self.recover_transactions(&mut block.transactions)?;

        let committed = {
            let mu = self.mu.lock();
            if self.store.has_block(&block.hash())? {
                return Ok(AddBlockResult::AlreadyExists);
            }
            // a reset may have removed the parent since the first lookup
            let parent = match self.store.header_by_hash(&block.pre_hash())? {
                Some(p) => p,
                None => {
                    drop(mu);
                    self.park_orphan(source, block);
                    return Ok(AddBlockResult::ParentMissing);
                }
            };
            let top = self.top();
            if parent.hash != top.hash {
                let local = top.weight();
                let incoming = block.header.weight();
                if local > incoming {
                    return Ok(AddBlockResult::LocalHeavier);
                }
                if local == incoming {
                    return Ok(AddBlockResult::AlreadyExists);
                }
                info!(
                    "[chain] heavier branch at {} ({}), resetting head {} -> {}",
                    block.height(),
                    incoming,
                    top.height,
                    parent.height
                );
                self.reset_top_locked(&parent)?;
            }
            self.execute_and_commit(&block)?;
            block
        };

        self.after_commit(&committed);
        Ok(AddBlockResult::Success)
    }

    fn check_body_limits(&self, block: &Block) -> Result<(), AdmissionError> {
        let count = block.transactions.len();
        if count > self.config.max_txs_per_block {
            return Err(AdmissionError::TooManyTxs {
                count,
                max: self.config.max_txs_per_block,
            });
        }
        let size = block.body_size();
        if size > self.config.max_body_bytes {
            return Err(AdmissionError::BodyTooLarge {
                size,
                max: self.config.max_body_bytes,
            });
        }
        Ok(())
    }

    /// Fills in tx sources. A pool copy with the same hash and signature is
    /// trusted; anything else is verified here and staged into the pool.
    fn recover_transactions(&self, txs: &mut [Transaction]) -> Result<(), AdmissionError> {
        let mut staged = Vec::new();
        for tx in txs.iter_mut() {
            if let Some(pooled) = self.pool.get_transaction(tx.is_reward(), &tx.hash) {
                if pooled.sign == tx.sign && pooled.source.is_some() {
                    tx.source = pooled.source;
                    continue;
                }
            }
            tx.recover_source()?;
            staged.push(tx.clone());
        }
        for tx in staged {
            match self.pool.add_transaction(tx) {
                Ok(()) | Err(PoolError::Duplicate(_)) => {}
                Err(e) => debug!("[chain] could not stage tx: {}", e),
            }
        }
        Ok(())
    }

    /// Executes a block on top of the head and persists it. Caller holds `mu`
    /// and has checked that the block's parent is the head.
    fn execute_and_commit(&self, block: &Block) -> Result<(), AdmissionError> {
        let hash = block.hash();
        let cached = self.verified_blocks.lock().remove(&hash);
        let output = match cached {
            Some(out) => out,
            None => {
                let head = self.head.read();
                self.processor
                    .process(&head.state, &block.header, &block.transactions, false)
            }
        };
        Self::check_execution(block, &output)?;

        {
            let _w = self.rw_lock.write();
            self.store.commit_block(block, &output.receipts, &output.state)?;
            *self.head.write() = ChainTop {
                header: block.header.clone(),
                state: output.state,
            };
        }

        let mut drop_hashes: Vec<_> = block.transactions.iter().map(|t| t.hash).collect();
        drop_hashes.extend(output.evicted.iter().copied());
        self.pool.remove_from_pool(&drop_hashes);
        self.top_raw_blocks.lock().insert(hash, block.clone());
        Ok(())
    }

    fn check_execution(block: &Block, output: &ExecuteOutput) -> Result<(), AdmissionError> {
        let header = &block.header;
        let mismatch = |field| AdmissionError::ExecutionMismatch {
            field,
            hash: header.hash,
        };
        if tx_tree(&block.transactions) != header.tx_tree {
            return Err(mismatch("tx_tree"));
        }
        if output.gas_fee != header.gas_fee {
            return Err(mismatch("gas_fee"));
        }
        if output.state_root != header.state_tree {
            return Err(mismatch("state_tree"));
        }
        if receipt_tree(&output.receipts) != header.receipt_tree {
            return Err(mismatch("receipt_tree"));
        }
        Ok(())
    }

    /// Listener fan-out and replay of a parked child. Runs without `mu`.
    fn after_commit(&self, block: &Block) {
        info!(
            "[chain] new head {} at height {} ({} txs)",
            block.hash().short(),
            block.height(),
            block.transactions.len()
        );
        for listener in self.listeners() {
            listener.on_block_added(block);
            listener.on_new_top(&block.header);
        }
        let waiting = self.future_blocks.lock().remove(&block.hash());
        if let Some(child) = waiting {
            debug!("[chain] replaying parked block {}", child.block.hash().short());
            self.add_block(child.source.as_ref(), child.block);
        }
    }

    /// Parks a block whose parent is unknown and hands the source peer to
    /// fork processing (parent would sit at or below our height) or to sync.
    fn park_orphan(&self, source: Option<&PeerId>, block: Block) {
        let pre_height = self.consensus.estimate_pre_height(&block.header);
        let local_height = self.top().height;
        self.future_blocks.lock().insert(
            block.pre_hash(),
            FutureBlock {
                block: block.clone(),
                source: source.cloned(),
            },
        );
        let (Some(source), Some(handler)) = (source, self.orphan_handler()) else {
            return;
        };
        if pre_height <= local_height {
            debug!(
                "[chain] orphan {} at {} from {}, suspecting fork",
                block.hash().short(),
                block.height(),
                source
            );
            handler.on_fork_suspected(source.clone(), block);
        } else {
            debug!("[chain] orphan at {} from {}, local {}, syncing", block.height(), source, local_height);
            handler.on_behind(source.clone(), block.header);
        }
    }

    /// Admits a chained run of blocks, resetting to the run's parent first
    /// when the run ends heavier than the head. `callback` sees every result
    /// and stops the run by returning false.
    pub fn batch_add<F>(
        &self,
        source: Option<&PeerId>,
        module: &str,
        blocks: Vec<Block>,
        mut callback: F,
    ) -> Result<(), AdmissionError>
    where
        F: FnMut(&Block, AddBlockResult) -> bool,
    {
        if blocks.is_empty() {
            return Ok(());
        }
        for pair in blocks.windows(2) {
            if pair[1].pre_hash() != pair[0].hash() || pair[1].height() != pair[0].height() + 1 {
                return Err(AdmissionError::NotChained(pair[1].height()));
            }
        }
        self.stage_batch_txs(&blocks);

        let _batch = self.batch_mu.lock();
        let mut start = None;
        for (i, b) in blocks.iter().enumerate() {
            if !self.store.has_block(&b.hash())? {
                start = Some(i);
                break;
            }
        }
        let Some(start) = start else {
            debug!("[chain] {} batch of {} already present", module, blocks.len());
            return Ok(());
        };

        let first = &blocks[start];
        let top = self.top();
        if first.pre_hash() != top.hash {
            match self.store.header_by_hash(&first.pre_hash())? {
                Some(parent) => {
                    let last = &blocks[blocks.len() - 1];
                    if last.header.weight() > top.weight() {
                        info!(
                            "[chain] {} batch ending at {} outweighs head {}, resetting to {}",
                            module,
                            last.height(),
                            top.height,
                            parent.height
                        );
                        self.reset_top(&parent)?;
                    }
                }
                None => {
                    if let (Some(src), Some(handler)) = (source, self.orphan_handler()) {
                        handler.on_fork_suspected(src.clone(), first.clone());
                    }
                    return Ok(());
                }
            }
        }

        let _adjusting = self.begin_adjusting();
        for block in blocks.into_iter().skip(start) {
            let result = self.add_block(source, block.clone());
            if !callback(&block, result) {
                break;
            }
        }
        Ok(())
    }

    /// Verifies batch transactions up front and stages them, so per-block
    /// admission finds trusted pool copies.
    fn stage_batch_txs(&self, blocks: &[Block]) {
        let mut verified = Vec::new();
        for block in blocks {
            for tx in &block.transactions {
                let mut tx = tx.clone();
                if tx.recover_source().is_ok() {
                    verified.push(tx);
                }
            }
        }
        if !verified.is_empty() {
            self.pool.async_add_txs(verified);
        }
    }
}
