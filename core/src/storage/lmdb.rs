use std::path::Path;

use heed::byteorder::BigEndian;
use heed::types::*;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{StoreConfig, StoreError};
use crate::blockchain::block::{Block, BlockHeader};
use crate::crypto::Hash;
use crate::state::AccountState;
use crate::tx::{Receipt, Transaction};

const META_CURRENT: &str = "current";

/// A receipt with the block it was committed by. The same transaction may
/// sit in blocks on two branches; only the owner deletes the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceiptRecord {
    block: Hash,
    receipt: Receipt,
}

/// Persistent chain records in one LMDB environment.
///
/// Every mutation that moves the head (commit, unwind) is a single write
/// transaction, so a crash leaves either the old or the new head, never half.
#[derive(Clone)]
pub struct ChainStore {
    env: Env,
    headers: Database<Bytes, SerdeBincode<BlockHeader>>, // hash -> header
    height_to_hash: Database<U64<BigEndian>, Bytes>,    // height -> hash, canonical only
    bodies: Database<Bytes, SerdeBincode<Vec<Transaction>>>, // hash -> txs
    receipts: Database<Bytes, SerdeBincode<ReceiptRecord>>, // tx hash -> owning block, receipt
    /// State snapshots by state root. Never pruned on unwind: an empty block
    /// shares its parent's root.
    states: Database<Bytes, SerdeBincode<AccountState>>,
    meta: Database<Str, Bytes>,
}

fn to_hash(bytes: &[u8]) -> Result<Hash, StoreError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("hash of {} bytes", bytes.len())))?;
    Ok(Hash(arr))
}

impl ChainStore {
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;
        let map_size_bytes = config.map_size_mb.max(1) * 1024 * 1024;
        let env = unsafe {
            let mut opts = EnvOpenOptions::new();
            opts.map_size(map_size_bytes).max_dbs(8);
            if config.no_sync {
                opts.flags(EnvFlags::NO_SYNC);
            }
            opts.open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let headers = env.create_database(&mut wtxn, Some("headers"))?;
        let height_to_hash = env.create_database(&mut wtxn, Some("height_to_hash"))?;
        let bodies = env.create_database(&mut wtxn, Some("bodies"))?;
        let receipts = env.create_database(&mut wtxn, Some("receipts"))?;
        let states = env.create_database(&mut wtxn, Some("states"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;
        debug!("[store] opened {}", path.display());

        Ok(Self {
            env,
            headers,
            height_to_hash,
            bodies,
            receipts,
            states,
            meta,
        })
    }

    // --- Reads ---

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.headers.get(&rtxn, &hash.0[..])?)
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.headers.get(&rtxn, &hash.0[..])?.is_some())
    }

    pub fn hash_at(&self, height: u64) -> Result<Option<Hash>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.height_to_hash
            .get(&rtxn, &height)?
            .map(to_hash)
            .transpose()
    }

    pub fn header_by_height(&self, height: u64) -> Result<Option<BlockHeader>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.header_at_in(&rtxn, height)
    }

    fn header_at_in(&self, rtxn: &RoTxn, height: u64) -> Result<Option<BlockHeader>, StoreError> {
        match self.height_to_hash.get(rtxn, &height)? {
            Some(hash) => Ok(self.headers.get(rtxn, hash)?),
            None => Ok(None),
        }
    }

    fn block_in(&self, rtxn: &RoTxn, header: BlockHeader) -> Result<Block, StoreError> {
        let transactions = self
            .bodies
            .get(rtxn, &header.hash.0[..])?
            .ok_or_else(|| StoreError::Missing {
                what: "body",
                key: header.hash.to_hex(),
            })?;
        Ok(Block { header, transactions })
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.read_txn()?;
        match self.headers.get(&rtxn, &hash.0[..])? {
            Some(header) => Ok(Some(self.block_in(&rtxn, header)?)),
            None => Ok(None),
        }
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.read_txn()?;
        match self.header_at_in(&rtxn, height)? {
            Some(header) => Ok(Some(self.block_in(&rtxn, header)?)),
            None => Ok(None),
        }
    }

    /// Highest canonical header at or below `height`.
    pub fn header_floor(&self, height: u64) -> Result<Option<BlockHeader>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let found = match self.height_to_hash.rev_range(&rtxn, &(..=height))?.next() {
            Some(entry) => Some(entry?.1),
            None => None,
        };
        match found {
            Some(hash) => Ok(self.headers.get(&rtxn, hash)?),
            None => Ok(None),
        }
    }

    /// Lowest canonical header at or above `height`.
    pub fn header_ceil(&self, height: u64) -> Result<Option<BlockHeader>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let found = match self.height_to_hash.range(&rtxn, &(height..))?.next() {
            Some(entry) => Some(entry?.1),
            None => None,
        };
        match found {
            Some(hash) => Ok(self.headers.get(&rtxn, hash)?),
            None => Ok(None),
        }
    }

    /// Canonical blocks from `height` upward, at most `limit` of them.
    pub fn blocks_after_height(&self, height: u64, limit: usize) -> Result<Vec<Block>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::with_capacity(limit.min(64));
        for entry in self.height_to_hash.range(&rtxn, &(height..))? {
            if out.len() >= limit {
                break;
            }
            let (_, hash) = entry?;
            if let Some(header) = self.headers.get(&rtxn, hash)? {
                out.push(self.block_in(&rtxn, header)?);
            }
        }
        Ok(out)
    }

    /// Canonical blocks with `begin <= height < end`.
    pub fn blocks_between(&self, begin: u64, end: u64) -> Result<Vec<Block>, StoreError> {
        if end <= begin {
            return Ok(Vec::new());
        }
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.height_to_hash.range(&rtxn, &(begin..end))? {
            let (_, hash) = entry?;
            if let Some(header) = self.headers.get(&rtxn, hash)? {
                out.push(self.block_in(&rtxn, header)?);
            }
        }
        Ok(out)
    }

    pub fn receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.receipts.get(&rtxn, &tx_hash.0[..])?.map(|rec| rec.receipt))
    }

    pub fn state_at(&self, root: &Hash) -> Result<Option<AccountState>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.states.get(&rtxn, &root.0[..])?)
    }

    /// Hash of the persisted head, `None` on a fresh store.
    pub fn current(&self) -> Result<Option<Hash>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.meta.get(&rtxn, META_CURRENT)?.map(to_hash).transpose()
    }

    // --- Writes ---

    /// Persists a block as the new head: header, height index, body,
    /// receipts, post state and the current pointer in one transaction.
    pub fn commit_block(
        &self,
        block: &Block,
        receipts: &[Receipt],
        state: &AccountState,
    ) -> Result<(), StoreError> {
        let hash = block.hash();
        let mut wtxn = self.env.write_txn()?;
        self.headers.put(&mut wtxn, &hash.0[..], &block.header)?;
        self.height_to_hash.put(&mut wtxn, &block.height(), &hash.0[..])?;
        self.bodies.put(&mut wtxn, &hash.0[..], &block.transactions)?;
        for r in receipts {
            let record = ReceiptRecord {
                block: hash,
                receipt: r.clone(),
            };
            self.receipts.put(&mut wtxn, &r.tx_hash.0[..], &record)?;
        }
        self.states.put(&mut wtxn, &block.header.state_tree.0[..], state)?;
        self.meta.put(&mut wtxn, META_CURRENT, &hash.0[..])?;
        wtxn.commit()?;
        Ok(())
    }

    /// Deletes `removed` (head first) and points the head at `new_top`, in
    /// one transaction. Returns the bodies of the removed blocks, in the same
    /// order, so their transactions can be recovered.
    pub fn unwind(
        &self,
        removed: &[BlockHeader],
        new_top: &BlockHeader,
    ) -> Result<Vec<Vec<Transaction>>, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let mut bodies = Vec::with_capacity(removed.len());
        for header in removed {
            let key = &header.hash.0[..];
            let txs = self.bodies.get(&wtxn, key)?.unwrap_or_default();
            for tx in &txs {
                let owned = matches!(self.receipts.get(&wtxn, &tx.hash.0[..])?, Some(rec) if rec.block == header.hash);
                if owned {
                    self.receipts.delete(&mut wtxn, &tx.hash.0[..])?;
                }
            }
            self.bodies.delete(&mut wtxn, key)?;
            self.headers.delete(&mut wtxn, key)?;
            let canonical = matches!(self.height_to_hash.get(&wtxn, &header.height)?, Some(h) if h == key);
            if canonical {
                self.height_to_hash.delete(&mut wtxn, &header.height)?;
            }
            bodies.push(txs);
        }
        self.meta.put(&mut wtxn, META_CURRENT, &new_top.hash.0[..])?;
        wtxn.commit()?;
        Ok(bodies)
    }

    /// Drops a single non-head block.
    pub fn remove_block(&self, header: &BlockHeader) -> Result<(), StoreError> {
        let key = &header.hash.0[..];
        let mut wtxn = self.env.write_txn()?;
        let txs = self.bodies.get(&wtxn, key)?.unwrap_or_default();
        for tx in &txs {
            let owned = matches!(self.receipts.get(&wtxn, &tx.hash.0[..])?, Some(rec) if rec.block == header.hash);
            if owned {
                self.receipts.delete(&mut wtxn, &tx.hash.0[..])?;
            }
        }
        self.bodies.delete(&mut wtxn, key)?;
        self.headers.delete(&mut wtxn, key)?;
        let canonical = matches!(self.height_to_hash.get(&wtxn, &header.height)?, Some(h) if h == key);
        if canonical {
            self.height_to_hash.delete(&mut wtxn, &header.height)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}
