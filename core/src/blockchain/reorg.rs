//! Head rollback.
//!
//! `reset_top` unwinds the head to an ancestor when a heavier branch shows
//! up. The deletions and the new current pointer go to the store in one
//! write. The ancestor state is loaded before that write, so a failure
//! leaves the old head in place.
use log::{debug, info};

use super::block::{Block, BlockHeader};
use super::{AdmissionError, BlockChain, ChainTop};

impl BlockChain {
    /// Rolls the head back to `ancestor`, which must be on the canonical
    /// chain. Removed transactions go back to the pool.
    pub fn reset_top(&self, ancestor: &BlockHeader) -> Result<(), AdmissionError> {
        let _mu = self.mu.lock();
        self.reset_top_locked(ancestor)
    }

    /// `reset_top` for callers already holding `mu`.
    pub(super) fn reset_top_locked(&self, ancestor: &BlockHeader) -> Result<(), AdmissionError> {
        let _adjusting = self.begin_adjusting();

        let (removed, bodies) = {
            let _w = self.rw_lock.write();
            let top = self.head.read().header.clone();
            if top.hash == ancestor.hash {
                return Ok(());
            }

            let mut removed = Vec::new();
            let mut cursor = top;
            while cursor.hash != ancestor.hash {
                if cursor.height <= ancestor.height {
                    return Err(AdmissionError::NotAncestor(ancestor.hash));
                }
                let parent = self.store.header_by_hash(&cursor.pre_hash)?.ok_or(AdmissionError::NotAncestor(ancestor.hash))?;
                removed.push(cursor);
                cursor = parent;
            }

            let state = self
                .store
                .state_at(&ancestor.state_tree)?
                .ok_or(AdmissionError::MissingState(ancestor.state_tree))?;
            let bodies = self.store.unwind(&removed, ancestor)?;
            *self.head.write() = ChainTop {
                header: ancestor.clone(),
                state,
            };
            (removed, bodies)
        };

        self.verified_blocks.lock().clear();
        {
            let mut ring = self.top_raw_blocks.lock();
            for h in &removed {
                ring.remove(&h.hash);
            }
        }
        *self.latest_cp.write() = None;

        let recovered: Vec<_> = bodies.into_iter().flatten().collect();
        let recovered_count = recovered.len();
        if !recovered.is_empty() {
            self.pool.back_to_pool(recovered);
        }

        info!(
            "[chain] reset head to {} at height {}, removed {} blocks, {} txs back to pool",
            ancestor.hash.short(),
            ancestor.height,
            removed.len(),
            recovered_count
        );

        let listeners = self.listeners();
        for header in &removed {
            for l in &listeners {
                l.on_block_removed(header);
            }
        }
        for l in &listeners {
            l.on_new_top(ancestor);
        }
        Ok(())
    }

    /// Deletes one block that is not the head.
    pub fn remove_orphan(&self, block: &Block) -> Result<(), AdmissionError> {
        let _mu = self.mu.lock();
        if self.head.read().header.hash == block.hash() {
            return Err(AdmissionError::RemovingHead(block.hash()));
        }
        {
            let _w = self.rw_lock.write();
            self.store.remove_block(&block.header)?;
        }
        if self.top_raw_blocks.lock().remove(&block.hash()).is_none() {
            debug!("[chain] orphan {} was not in the recent ring", block.hash().short());
        }
        info!("[chain] removed orphan {} at {}", block.hash().short(), block.height());
        Ok(())
    }
}
