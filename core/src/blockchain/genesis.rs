use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::blockchain::block::{receipt_tree, tx_tree, Block, BlockHeader};
use crate::config::GenesisConfig;
use crate::crypto::Hash;
use crate::groups::{Group, GroupChain};
use crate::state::AccountState;

/// Genesis block, its state and the genesis group. Every node with the same
/// genesis config derives byte-identical values.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub block: Block,
    pub state: AccountState,
    pub group: Group,
}

impl Genesis {
    pub fn from_config(cfg: &GenesisConfig) -> Result<Self> {
        let group = GroupChain::genesis_group(&cfg.seed, cfg.parsed_members()?);
        let state = AccountState::with_allocations(cfg.parsed_allocations()?);

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&Sha256::digest(cfg.seed.as_bytes()));

        let mut header = BlockHeader {
            height: 0,
            hash: Hash::ZERO,
            pre_hash: Hash(seed),
            state_tree: state.root(),
            tx_tree: tx_tree(&[]),
            receipt_tree: receipt_tree(&[]),
            gas_fee: 0,
            total_qn: 0,
            prove_value: Vec::new(),
            group_id: group.id,
            castor: Vec::new(),
            cur_time: cfg.timestamp,
            signature: Vec::new(),
        };
        header.hash = header.compute_hash();

        Ok(Self {
            block: Block {
                header,
                transactions: Vec::new(),
            },
            state,
            group,
        })
    }
}
