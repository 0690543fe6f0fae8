//! Chain head: the single funnel for block admission.
//!
//! `BlockChain` owns the persisted chain, the in-memory head pointer and the
//! caches around admission. The admission path lives in `admission`,
//! rollback in `reorg`, self-proposed blocks in `cast` and read access in
//! `query`.
//!
//! Locks, always taken in this order:
//! - `batch_mu` serialises whole batches (sync responses, fork pieces)
//! - `mu` covers one admission decision plus its commit
//! - `rw_lock` separates readers from commit/reset/remove
//!
//! The head pointer only ever moves to a block whose records are fully
//! persisted.

pub mod admission;
pub mod block;
pub mod cast;
pub mod consensus;
pub mod events;
pub mod genesis;
pub mod query;
pub mod reorg;

use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::{BoundedMap, EvictionOrder};
use crate::config::ChainConfig;
use crate::crypto::Hash;
use crate::mempool::TransactionPool;
use crate::p2p::PeerId;
use crate::state::{AccountState, ExecuteOutput, StateProcessor};
use crate::storage::{ChainStore, StoreError};
use crate::tx::TxError;

pub use block::{Block, BlockHeader, BlockWeight};
pub use consensus::{BasicConsensus, ConsensusError, ConsensusHelper};
pub use events::{ChainListener, OrphanHandler};
pub use genesis::Genesis;

/// Outcome of offering one block to the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBlockResult {
    Success,
    AlreadyExists,
    LocalHeavier,
    ConsensusFailed,
    /// Parent unknown; the block is parked and fork processing or sync was
    /// kicked off.
    ParentMissing,
    Failed,
}

impl AddBlockResult {
    /// Success or a harmless duplicate.
    pub fn is_ok(self) -> bool {
        matches!(self, AddBlockResult::Success | AddBlockResult::AlreadyExists)
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("block hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: Hash, computed: Hash },
    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("block body {size} bytes exceeds {max}")]
    BodyTooLarge { size: usize, max: usize },
    #[error("block carries {count} txs, limit {max}")]
    TooManyTxs { count: usize, max: usize },
    #[error("invalid transaction: {0}")]
    BadTransaction(#[from] TxError),
    #[error("{field} mismatch in block {hash}")]
    ExecutionMismatch { field: &'static str, hash: Hash },
    #[error("no state for root {0}")]
    MissingState(Hash),
    #[error("{0} is not an ancestor of the head")]
    NotAncestor(Hash),
    #[error("block {0} is the head, not an orphan")]
    RemovingHead(Hash),
    #[error("batch is not a chain at height {0}")]
    NotChained(u64),
    #[error("genesis mismatch: stored {stored}, configured {configured}")]
    GenesisMismatch { stored: Hash, configured: Hash },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn result(&self) -> AddBlockResult {
        match self {
            AdmissionError::Consensus(_) => AddBlockResult::ConsensusFailed,
            _ => AddBlockResult::Failed,
        }
    }
}

/// Head pointer: latest header plus the state after it.
#[derive(Debug, Clone)]
pub struct ChainTop {
    pub header: BlockHeader,
    pub state: AccountState,
}

/// Whether the head is being moved by a reset or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainActivity {
    Idle,
    Adjusting,
}

/// Holds the chain in `Adjusting` until dropped. A guard taken while the
/// chain is already adjusting is inert.
pub struct AdjustGuard<'a> {
    activity: &'a Mutex<ChainActivity>,
    owned: bool,
}

impl Drop for AdjustGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            *self.activity.lock() = ChainActivity::Idle;
        }
    }
}

pub(crate) struct FutureBlock {
    block: Block,
    source: Option<PeerId>,
}

pub struct BlockChain {
    config: ChainConfig,
    store: ChainStore,
    consensus: Arc<dyn ConsensusHelper>,
    processor: Arc<dyn StateProcessor>,
    pool: Arc<dyn TransactionPool>,

    head: RwLock<ChainTop>,
    rw_lock: RwLock<()>,
    mu: Mutex<()>,
    batch_mu: Mutex<()>,
    activity: Mutex<ChainActivity>,

    /// Parked blocks keyed by the parent they wait for.
    future_blocks: Mutex<BoundedMap<Hash, FutureBlock>>,
    /// Execution results by block hash, for pre-verified and self-cast blocks.
    verified_blocks: Mutex<BoundedMap<Hash, ExecuteOutput>>,
    /// Ring of the most recently committed raw blocks.
    top_raw_blocks: Mutex<BoundedMap<Hash, Block>>,
    latest_cp: RwLock<Option<BlockHeader>>,

    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
    orphan_handler: RwLock<Option<Arc<dyn OrphanHandler>>>,
}

impl BlockChain {
    /// Opens the chain on `store`, writing `genesis` first if the store is
    /// empty.
    pub fn open(
        config: ChainConfig,
        store: ChainStore,
        genesis: &Genesis,
        consensus: Arc<dyn ConsensusHelper>,
        processor: Arc<dyn StateProcessor>,
        pool: Arc<dyn TransactionPool>,
    ) -> Result<Arc<Self>, AdmissionError> {
        let top = match store.current()? {
            Some(hash) => {
                let stored_genesis = store.hash_at(0)?.unwrap_or(Hash::ZERO);
                if stored_genesis != genesis.block.hash() {
                    return Err(AdmissionError::GenesisMismatch {
                        stored: stored_genesis,
                        configured: genesis.block.hash(),
                    });
                }
                let header = store.header_by_hash(&hash)?.ok_or_else(|| StoreError::Missing {
                    what: "head header",
                    key: hash.to_hex(),
                })?;
                let state = store
                    .state_at(&header.state_tree)?
                    .ok_or(AdmissionError::MissingState(header.state_tree))?;
                info!("[chain] resumed at height {} ({})", header.height, header.hash.short());
                ChainTop { header, state }
            }
            None => {
                store.commit_block(&genesis.block, &[], &genesis.state)?;
                info!("[chain] wrote genesis {}", genesis.block.hash().short());
                ChainTop {
                    header: genesis.block.header.clone(),
                    state: genesis.state.clone(),
                }
            }
        };

        Ok(Arc::new(Self {
            future_blocks: Mutex::new(BoundedMap::lru(config.future_blocks_cache)),
            verified_blocks: Mutex::new(BoundedMap::lru(config.verified_cache)),
            top_raw_blocks: Mutex::new(BoundedMap::new(config.top_raw_blocks, EvictionOrder::InsertionOrder)),
            config,
            store,
            consensus,
            processor,
            pool,
            head: RwLock::new(top),
            rw_lock: RwLock::new(()),
            mu: Mutex::new(()),
            batch_mu: Mutex::new(()),
            activity: Mutex::new(ChainActivity::Idle),
            latest_cp: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            orphan_handler: RwLock::new(None),
        }))
    }

    pub fn add_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.write().push(listener);
    }

    pub fn set_orphan_handler(&self, handler: Arc<dyn OrphanHandler>) {
        *self.orphan_handler.write() = Some(handler);
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusHelper> {
        &self.consensus
    }

    pub fn pool(&self) -> &Arc<dyn TransactionPool> {
        &self.pool
    }

    pub fn activity(&self) -> ChainActivity {
        *self.activity.lock()
    }

    pub fn is_adjusting(&self) -> bool {
        self.activity() == ChainActivity::Adjusting
    }

    pub(crate) fn begin_adjusting(&self) -> AdjustGuard<'_> {
        let mut activity = self.activity.lock();
        let owned = *activity == ChainActivity::Idle;
        *activity = ChainActivity::Adjusting;
        AdjustGuard {
            activity: &self.activity,
            owned,
        }
    }

    fn orphan_handler(&self) -> Option<Arc<dyn OrphanHandler>> {
        self.orphan_handler.read().clone()
    }

    fn listeners(&self) -> Vec<Arc<dyn ChainListener>> {
        self.listeners.read().clone()
    }
}
