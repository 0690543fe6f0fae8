use log::debug;
use parking_lot::RwLock;

use super::{PoolError, TransactionPool};
use crate::common::{BoundedMap, EvictionOrder};
use crate::crypto::Hash;
use crate::tx::Transaction;

/// Maximum number of regular transactions held.
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

/// Reward transactions are few; they get their own small bucket.
pub const MAX_REWARD_TXS: usize = 256;

struct PoolInner {
    regular: BoundedMap<Hash, Transaction>,
    rewards: BoundedMap<Hash, Transaction>,
}

impl PoolInner {
    fn bucket(&mut self, tx: &Transaction) -> &mut BoundedMap<Hash, Transaction> {
        if tx.is_reward() {
            &mut self.rewards
        } else {
            &mut self.regular
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.regular.contains(hash) || self.rewards.contains(hash)
    }

    fn stage(&mut self, tx: Transaction) {
        let hash = tx.hash;
        if let Some((old, _)) = self.bucket(&tx).insert(hash, tx) {
            debug!("[pool] full, evicted oldest tx {}", old.short());
        }
    }
}

/// Hash-indexed transaction pool. A full pool drops its oldest entry.
pub struct Mempool {
    inner: RwLock<PoolInner>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_capacity(MAX_MEMPOOL_SIZE)
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                regular: BoundedMap::new(capacity, EvictionOrder::InsertionOrder),
                rewards: BoundedMap::new(MAX_REWARD_TXS, EvictionOrder::InsertionOrder),
            }),
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().contains(hash)
    }

    /// Up to `max` pooled transactions accepted by `keep`, rewards first,
    /// oldest first within each bucket.
    pub fn pending_where<F>(&self, max: usize, mut keep: F) -> Vec<Transaction>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let inner = self.inner.read();
        let rewards = inner.rewards.keys_by_age().filter_map(|h| inner.rewards.peek(h));
        let regular = inner.regular.keys_by_age().filter_map(|h| inner.regular.peek(h));
        rewards.chain(regular).filter(|tx| keep(tx)).take(max).cloned().collect()
    }
}

impl TransactionPool for Mempool {
    fn pack_for_cast(&self, max: usize) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut rewards: Vec<Transaction> = inner.rewards.iter().map(|(_, tx)| tx.clone()).collect();
        rewards.sort_by_key(|tx| tx.hash);
        let mut regular: Vec<Transaction> = inner.regular.iter().map(|(_, tx)| tx.clone()).collect();
        // per-sender nonce order, higher gas price first across senders
        regular.sort_by(|a, b| {
            a.nonce
                .cmp(&b.nonce)
                .then_with(|| b.gas_price.cmp(&a.gas_price))
                .then_with(|| a.hash.cmp(&b.hash))
        });
        rewards.into_iter().chain(regular).take(max).collect()
    }

    fn add_transaction(&self, mut tx: Transaction) -> Result<(), PoolError> {
        if self.inner.read().contains(&tx.hash) {
            return Err(PoolError::Duplicate(tx.hash));
        }
        // signature work outside the lock
        tx.recover_source()?;
        let mut inner = self.inner.write();
        if inner.contains(&tx.hash) {
            return Err(PoolError::Duplicate(tx.hash));
        }
        inner.stage(tx);
        Ok(())
    }

    fn get_transaction(&self, only_reward: bool, hash: &Hash) -> Option<Transaction> {
        let inner = self.inner.read();
        if let Some(tx) = inner.rewards.peek(hash) {
            return Some(tx.clone());
        }
        if only_reward {
            return None;
        }
        inner.regular.peek(hash).cloned()
    }

    fn remove_from_pool(&self, hashes: &[Hash]) {
        let mut inner = self.inner.write();
        for h in hashes {
            if inner.regular.remove(h).is_none() {
                inner.rewards.remove(h);
            }
        }
    }

    fn back_to_pool(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.write();
        let mut restored = 0usize;
        for tx in txs {
            if inner.contains(&tx.hash) {
                continue;
            }
            inner.stage(tx);
            restored += 1;
        }
        if restored > 0 {
            debug!("[pool] {} txs back to pool", restored);
        }
    }

    fn async_add_txs(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.write();
        for tx in txs {
            if !inner.contains(&tx.hash) {
                inner.stage(tx);
            }
        }
    }

    fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.regular.len() + inner.rewards.len()
    }
}
