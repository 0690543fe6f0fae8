pub mod pool;

use thiserror::Error;

use crate::crypto::Hash;
use crate::tx::{Transaction, TxError};

pub use pool::Mempool;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction {0} already in pool")]
    Duplicate(Hash),
    #[error(transparent)]
    Invalid(#[from] TxError),
}

/// What the chain head needs from a transaction pool.
pub trait TransactionPool: Send + Sync {
    /// Up to `max` transactions for a new block, rewards first.
    fn pack_for_cast(&self, max: usize) -> Vec<Transaction>;

    /// Verifies and stages one transaction.
    fn add_transaction(&self, tx: Transaction) -> Result<(), PoolError>;

    /// Pool copy of a transaction. `only_reward` restricts the lookup to
    /// reward transactions.
    fn get_transaction(&self, only_reward: bool, hash: &Hash) -> Option<Transaction>;

    fn remove_from_pool(&self, hashes: &[Hash]);

    /// Returns transactions from blocks dropped by a reorg.
    fn back_to_pool(&self, txs: Vec<Transaction>);

    /// Stages already-verified transactions, ignoring duplicates.
    fn async_add_txs(&self, txs: Vec<Transaction>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
