//! Read access to the chain. Readers hold the read side of `rw_lock`, so
//! they never observe a half-applied commit or reset. Store failures are
//! logged and read as "not found".

use log::error;

use super::block::{Block, BlockHeader, BlockWeight};
use super::BlockChain;
use crate::crypto::Hash;
use crate::state::AccountState;
use crate::storage::StoreError;
use crate::tx::Receipt;

fn logged<T>(what: &str, r: Result<T, StoreError>) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) => {
            error!("[chain] {} failed: {}", what, e);
            None
        }
    }
}

impl BlockChain {
    pub fn top(&self) -> BlockHeader {
        self.head.read().header.clone()
    }

    pub fn top_weight(&self) -> BlockWeight {
        self.head.read().header.weight()
    }

    pub fn height(&self) -> u64 {
        self.head.read().header.height
    }

    pub fn latest_state(&self) -> AccountState {
        self.head.read().state.clone()
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        let _r = self.rw_lock.read();
        logged("has_block", self.store.has_block(hash)).unwrap_or(false)
    }

    pub fn has_height(&self, height: u64) -> bool {
        let _r = self.rw_lock.read();
        matches!(logged("has_height", self.store.hash_at(height)), Some(Some(_)))
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        let _r = self.rw_lock.read();
        logged("header_by_hash", self.store.header_by_hash(hash)).flatten()
    }

    pub fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        let _r = self.rw_lock.read();
        logged("header_by_height", self.store.header_by_height(height)).flatten()
    }

    /// Highest header at or below `height`.
    pub fn header_floor(&self, height: u64) -> Option<BlockHeader> {
        let _r = self.rw_lock.read();
        logged("header_floor", self.store.header_floor(height)).flatten()
    }

    /// Lowest header at or above `height`.
    pub fn header_ceil(&self, height: u64) -> Option<BlockHeader> {
        let _r = self.rw_lock.read();
        logged("header_ceil", self.store.header_ceil(height)).flatten()
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        if let Some(b) = self.top_raw_blocks.lock().peek(hash) {
            return Some(b.clone());
        }
        let _r = self.rw_lock.read();
        logged("block_by_hash", self.store.block_by_hash(hash)).flatten()
    }

    pub fn block_by_height(&self, height: u64) -> Option<Block> {
        let _r = self.rw_lock.read();
        logged("block_by_height", self.store.block_by_height(height)).flatten()
    }

    /// Up to `limit` blocks starting at `height`.
    pub fn blocks_after_height(&self, height: u64, limit: usize) -> Vec<Block> {
        let _r = self.rw_lock.read();
        logged("blocks_after_height", self.store.blocks_after_height(height, limit)).unwrap_or_default()
    }

    /// Blocks in `[begin, end)`.
    pub fn blocks_between(&self, begin: u64, end: u64) -> Vec<Block> {
        let _r = self.rw_lock.read();
        logged("blocks_between", self.store.blocks_between(begin, end)).unwrap_or_default()
    }

    pub fn receipt(&self, tx_hash: &Hash) -> Option<Receipt> {
        let _r = self.rw_lock.read();
        logged("receipt", self.store.receipt(tx_hash)).flatten()
    }

    /// First hash in `hashes` that is on the local chain.
    pub fn first_known(&self, hashes: &[Hash]) -> Option<BlockHeader> {
        let _r = self.rw_lock.read();
        hashes
            .iter()
            .find_map(|h| logged("first_known", self.store.header_by_hash(h)).flatten())
    }

    /// Header `checkpoint_depth` blocks below the head. Cached until the head
    /// height moves or a reset invalidates it.
    pub fn checkpoint(&self) -> Option<BlockHeader> {
        let top_height = self.height();
        let want = top_height.saturating_sub(self.config.checkpoint_depth);
        if let Some(cp) = self.latest_cp.read().as_ref() {
            if cp.height == want {
                return Some(cp.clone());
            }
        }
        let cp = self.header_by_height(want)?;
        *self.latest_cp.write() = Some(cp.clone());
        Some(cp)
    }

    pub fn checkpoint_height(&self) -> u64 {
        self.checkpoint().map(|h| h.height).unwrap_or(0)
    }
}
