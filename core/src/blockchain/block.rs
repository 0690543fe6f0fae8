use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Address, Hash, Keypair};
use crate::tx::{Receipt, Transaction};

/// Block header. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: Hash,
    pub pre_hash: Hash,
    pub state_tree: Hash,
    pub tx_tree: Hash,
    pub receipt_tree: Hash,
    pub gas_fee: u64,
    /// Accumulated qualification number, non-decreasing along a valid chain.
    pub total_qn: u64,
    /// Proving value, compared as a big unsigned integer on qn ties.
    pub prove_value: Vec<u8>,
    pub group_id: Hash,
    /// Proposer public key.
    pub castor: Vec<u8>,
    /// Unix milliseconds.
    pub cur_time: i64,
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Hash of every field except `hash` and `signature`.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.height.to_be_bytes());
        hasher.update(self.pre_hash.as_bytes());
        hasher.update(self.state_tree.as_bytes());
        hasher.update(self.tx_tree.as_bytes());
        hasher.update(self.receipt_tree.as_bytes());
        hasher.update(&self.gas_fee.to_be_bytes());
        hasher.update(&self.total_qn.to_be_bytes());
        hasher.update(&(self.prove_value.len() as u32).to_be_bytes());
        hasher.update(&self.prove_value);
        hasher.update(self.group_id.as_bytes());
        hasher.update(&(self.castor.len() as u32).to_be_bytes());
        hasher.update(&self.castor);
        hasher.update(&self.cur_time.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn hash_matches(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Fills `hash` and signs it with the castor key.
    pub fn seal(&mut self, castor: &Keypair) {
        self.castor = castor.public_key();
        self.hash = self.compute_hash();
        self.signature = castor.sign(self.hash.as_bytes());
    }

    pub fn signature_valid(&self) -> bool {
        crypto::verify(&self.castor, self.hash.as_bytes(), &self.signature)
    }

    pub fn castor_address(&self) -> Address {
        crypto::address_of(&self.castor)
    }

    pub fn weight(&self) -> BlockWeight {
        BlockWeight::of(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn pre_hash(&self) -> Hash {
        self.header.pre_hash
    }

    pub fn body_size(&self) -> usize {
        bincode::serialized_size(&self.transactions)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
    }
}

pub fn tx_tree(txs: &[Transaction]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"txs");
    for tx in txs {
        hasher.update(tx.hash.as_bytes());
    }
    hasher.finalize().into()
}

pub fn receipt_tree(receipts: &[Receipt]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"receipts");
    for r in receipts {
        hasher.update(r.digest().as_bytes());
    }
    hasher.finalize().into()
}

/// Total order over blocks: accumulated qn, then proving value, then hash.
/// Two weights compare equal only for the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWeight {
    pub total_qn: u64,
    pub prove_value: BigUint,
    pub hash: Hash,
}

impl BlockWeight {
    pub fn of(header: &BlockHeader) -> Self {
        Self {
            total_qn: header.total_qn,
            prove_value: BigUint::from_bytes_be(&header.prove_value),
            hash: header.hash,
        }
    }
}

impl Ord for BlockWeight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_qn
            .cmp(&other.total_qn)
            .then_with(|| self.prove_value.cmp(&other.prove_value))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for BlockWeight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qn={} pv={:x} {}", self.total_qn, self.prove_value, self.hash.short())
    }
}
