use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, Address, Hash, Keypair};

/// Gas units charged per executed transaction.
pub const TX_GAS_UNITS: u64 = 1_000;

/// Upper bound for `data`, checked before signature work.
pub const MAX_TX_DATA_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// Moves `value` from the signer to `target`, paying gas to the castor.
    Transfer,
    /// Mints `value` to `target`. Only the block's castor may include one.
    Reward,
}

impl TxKind {
    fn tag(self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Reward => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("tx hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: Hash, computed: Hash },
    #[error("tx {0} signature does not verify")]
    BadSignature(Hash),
    #[error("tx data too large: {0} bytes")]
    DataTooLarge(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub kind: TxKind,
    pub nonce: u64,
    pub value: u64,
    pub gas_price: u64,
    pub target: Address,
    pub data: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign: Vec<u8>,
    /// Recovered signer address, filled by `recover_source`. Never on the wire.
    #[serde(skip)]
    pub source: Option<Address>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.sign == other.sign
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn new_signed(
        kind: TxKind,
        nonce: u64,
        value: u64,
        gas_price: u64,
        target: Address,
        data: Vec<u8>,
        signer: &Keypair,
    ) -> Self {
        let mut tx = Transaction {
            hash: Hash::ZERO,
            kind,
            nonce,
            value,
            gas_price,
            target,
            data,
            public_key: signer.public_key(),
            sign: Vec::new(),
            source: Some(signer.address()),
        };
        tx.hash = tx.compute_hash();
        tx.sign = signer.sign(tx.hash.as_bytes());
        tx
    }

    pub fn transfer(signer: &Keypair, nonce: u64, target: Address, value: u64, gas_price: u64) -> Self {
        Self::new_signed(TxKind::Transfer, nonce, value, gas_price, target, Vec::new(), signer)
    }

    /// Hash over every field except `hash`, `sign` and `source`.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.kind.tag()]);
        hasher.update(&self.nonce.to_be_bytes());
        hasher.update(&self.value.to_be_bytes());
        hasher.update(&self.gas_price.to_be_bytes());
        hasher.update(self.target.as_bytes());
        hasher.update(&(self.data.len() as u64).to_be_bytes());
        hasher.update(&self.data);
        hasher.update(&self.public_key);
        hasher.finalize().into()
    }

    pub fn check_hash(&self) -> Result<(), TxError> {
        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(TxError::HashMismatch {
                declared: self.hash,
                computed,
            });
        }
        Ok(())
    }

    /// Verifies hash and signature, then records the signer address.
    pub fn recover_source(&mut self) -> Result<Address, TxError> {
        if self.data.len() > MAX_TX_DATA_BYTES {
            return Err(TxError::DataTooLarge(self.data.len()));
        }
        self.check_hash()?;
        if !crypto::verify(&self.public_key, self.hash.as_bytes(), &self.sign) {
            return Err(TxError::BadSignature(self.hash));
        }
        let addr = crypto::address_of(&self.public_key);
        self.source = Some(addr);
        Ok(addr)
    }

    pub fn gas_fee(&self) -> u64 {
        self.gas_price.saturating_mul(TX_GAS_UNITS)
    }

    pub fn is_reward(&self) -> bool {
        self.kind == TxKind::Reward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    /// Included in the block but rejected by the state machine.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub status: ReceiptStatus,
    pub gas_used: u64,
    pub height: u64,
    pub tx_index: u32,
}

impl Receipt {
    pub fn digest(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.tx_hash.as_bytes());
        hasher.update(&[matches!(self.status, ReceiptStatus::Success) as u8]);
        hasher.update(&self.gas_used.to_be_bytes());
        hasher.update(&self.height.to_be_bytes());
        hasher.update(&self.tx_index.to_be_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_tx_recovers_source() {
        let alice = Keypair::from_passphrase("alice");
        let bob = Keypair::from_passphrase("bob");
        let mut tx = Transaction::transfer(&alice, 1, bob.address(), 50, 2);
        tx.source = None;
        assert_eq!(tx.recover_source(), Ok(alice.address()));
        assert_eq!(tx.gas_fee(), 2 * TX_GAS_UNITS);
    }

    #[test]
    fn tampered_value_breaks_hash() {
        let alice = Keypair::from_passphrase("alice");
        let mut tx = Transaction::transfer(&alice, 1, Hash::ZERO, 50, 1);
        tx.value = 5_000;
        assert!(matches!(tx.recover_source(), Err(TxError::HashMismatch { .. })));
    }

    #[test]
    fn foreign_signature_rejected() {
        let alice = Keypair::from_passphrase("alice");
        let mallory = Keypair::from_passphrase("mallory");
        let mut tx = Transaction::transfer(&alice, 1, Hash::ZERO, 50, 1);
        tx.sign = mallory.sign(tx.hash.as_bytes());
        assert_eq!(tx.recover_source(), Err(TxError::BadSignature(tx.hash)));
    }

    #[test]
    fn source_is_not_serialized() {
        let alice = Keypair::from_passphrase("alice");
        let tx = Transaction::transfer(&alice, 3, Hash::ZERO, 1, 1);
        let bytes = bincode::serialize(&tx).expect("encode");
        let back: Transaction = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(back, tx);
        assert!(back.source.is_none());
    }
}
