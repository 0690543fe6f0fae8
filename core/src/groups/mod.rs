//! Consensus group chain.
//!
//! Groups form their own sequential chain. Each group names the block that
//! created it; a group is only admitted once that block is on the local
//! chain, and a block may only be cast by a group created below it.

use std::collections::HashMap;

use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Hash,
    pub pre_id: Hash,
    /// Position on the group chain, genesis group is 0.
    pub height: u64,
    /// Block whose admission created the group.
    pub create_block: Hash,
    pub create_height: u64,
    pub members: Vec<Vec<u8>>,
}

impl Group {
    pub fn new(pre: &Group, create_block: Hash, create_height: u64, members: Vec<Vec<u8>>) -> Self {
        let mut g = Group {
            id: Hash::ZERO,
            pre_id: pre.id,
            height: pre.height + 1,
            create_block,
            create_height,
            members,
        };
        g.id = g.compute_id();
        g
    }

    pub fn compute_id(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"group");
        hasher.update(self.pre_id.as_bytes());
        hasher.update(&self.height.to_be_bytes());
        hasher.update(self.create_block.as_bytes());
        hasher.update(&self.create_height.to_be_bytes());
        for m in &self.members {
            hasher.update(&(m.len() as u32).to_be_bytes());
            hasher.update(m);
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("group {0} already on chain")]
    AlreadyExists(Hash),
    #[error("group id {0} does not match its contents")]
    BadId(Hash),
    #[error("group at height {got} does not follow top {top}")]
    NotSequential { top: u64, got: u64 },
    #[error("group {0} does not link to the group top")]
    PreMismatch(Hash),
    #[error("creating block {0} not on chain yet")]
    CreateBlockMissing(Hash),
}

struct GroupChainInner {
    groups: Vec<Group>,
    by_id: HashMap<Hash, usize>,
}

/// In-memory sequential group chain.
pub struct GroupChain {
    inner: RwLock<GroupChainInner>,
}

impl GroupChain {
    pub fn new(genesis: Group) -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(genesis.id, 0);
        Self {
            inner: RwLock::new(GroupChainInner {
                groups: vec![genesis],
                by_id,
            }),
        }
    }

    pub fn genesis_group(seed: &str, members: Vec<Vec<u8>>) -> Group {
        let mut g = Group {
            id: Hash::ZERO,
            pre_id: Hash::digest(seed.as_bytes()),
            height: 0,
            create_block: Hash::ZERO,
            create_height: 0,
            members,
        };
        g.id = g.compute_id();
        g
    }

    pub fn height(&self) -> u64 {
        let inner = self.inner.read();
        inner.groups.len() as u64 - 1
    }

    pub fn top(&self) -> Group {
        let inner = self.inner.read();
        inner.groups[inner.groups.len() - 1].clone()
    }

    pub fn get_by_id(&self, id: &Hash) -> Option<Group> {
        let inner = self.inner.read();
        inner.by_id.get(id).map(|&i| inner.groups[i].clone())
    }

    pub fn get_by_height(&self, height: u64) -> Option<Group> {
        self.inner.read().groups.get(height as usize).cloned()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Groups from `height` upward, at most `limit`.
    pub fn groups_from(&self, height: u64, limit: usize) -> Vec<Group> {
        let inner = self.inner.read();
        inner
            .groups
            .iter()
            .skip(height as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest group allowed to cast at `height`: created strictly below it.
    pub fn castable_at(&self, height: u64) -> Group {
        let inner = self.inner.read();
        inner
            .groups
            .iter()
            .rev()
            .find(|g| g.create_height < height)
            .unwrap_or(&inner.groups[0])
            .clone()
    }

    /// Appends a group. `block_known` answers whether the creating block is
    /// on the local chain.
    pub fn add_group<F>(&self, group: Group, block_known: F) -> Result<(), GroupError>
    where
        F: Fn(&Hash) -> bool,
    {
        if group.compute_id() != group.id {
            return Err(GroupError::BadId(group.id));
        }
        if !block_known(&group.create_block) {
            return Err(GroupError::CreateBlockMissing(group.create_block));
        }
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&group.id) {
            return Err(GroupError::AlreadyExists(group.id));
        }
        let top = &inner.groups[inner.groups.len() - 1];
        if group.height != top.height + 1 {
            return Err(GroupError::NotSequential {
                top: top.height,
                got: group.height,
            });
        }
        if group.pre_id != top.id {
            return Err(GroupError::PreMismatch(group.id));
        }
        info!(
            "[groups] group {} added at height {} (created by block {})",
            group.id.short(),
            group.height,
            group.create_height
        );
        let idx = inner.groups.len();
        inner.by_id.insert(group.id, idx);
        inner.groups.push(group);
        Ok(())
    }
}
