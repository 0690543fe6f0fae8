//! Account state and the block execution seam.
//!
//! `StateProcessor` is what the chain head calls to execute a block. The
//! bundled `BasicProcessor` is a balance/nonce state machine over
//! [`TxKind`]; richer execution plugs in behind the same trait.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blockchain::block::BlockHeader;
use crate::crypto::{Address, Hash};
use crate::tx::{Receipt, ReceiptStatus, Transaction, TxKind, TX_GAS_UNITS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    accounts: BTreeMap<Address, Account>,
}

impl AccountState {
    pub fn with_allocations<I: IntoIterator<Item = (Address, u64)>>(allocations: I) -> Self {
        let mut state = Self::default();
        for (addr, balance) in allocations {
            state.credit(addr, balance);
        }
        state
    }

    pub fn account(&self, addr: &Address) -> Account {
        self.accounts.get(addr).copied().unwrap_or_default()
    }

    pub fn balance(&self, addr: &Address) -> u64 {
        self.account(addr).balance
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.account(addr).nonce
    }

    pub fn credit(&mut self, addr: Address, amount: u64) {
        let acct = self.accounts.entry(addr).or_default();
        acct.balance = acct.balance.saturating_add(amount);
    }

    fn debit(&mut self, addr: Address, amount: u64) -> bool {
        match self.accounts.get_mut(&addr) {
            Some(acct) if acct.balance >= amount => {
                acct.balance -= amount;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Root over the ordered account map.
    pub fn root(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"state");
        for (addr, acct) in &self.accounts {
            hasher.update(addr.as_bytes());
            hasher.update(&acct.balance.to_be_bytes());
            hasher.update(&acct.nonce.to_be_bytes());
        }
        hasher.finalize().into()
    }
}

/// Everything executing a block produces. Cached per block hash so a block
/// is not executed twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutput {
    pub state: AccountState,
    pub state_root: Hash,
    /// Transactions the pool should drop.
    pub evicted: Vec<Hash>,
    /// Transactions that made it into the block, in order.
    pub executed: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    pub gas_fee: u64,
}

pub trait StateProcessor: Send + Sync {
    /// Executes `txs` on top of `state` for the block described by `header`.
    ///
    /// With `proposing` set, invalid transactions are left out of the block;
    /// otherwise they stay in, get a failed receipt and change nothing.
    /// Must be deterministic.
    fn process(
        &self,
        state: &AccountState,
        header: &BlockHeader,
        txs: &[Transaction],
        proposing: bool,
    ) -> ExecuteOutput;
}

#[derive(Debug, Clone, Default)]
pub struct BasicProcessor;

impl BasicProcessor {
    pub fn new() -> Self {
        Self
    }

    fn apply(state: &mut AccountState, castor: Address, tx: &Transaction, reward_seen: &mut bool) -> bool {
        let source = match tx.source {
            Some(s) => s,
            None => crate::crypto::address_of(&tx.public_key),
        };
        match tx.kind {
            TxKind::Transfer => {
                let acct = state.account(&source);
                if tx.nonce != acct.nonce + 1 {
                    return false;
                }
                let fee = tx.gas_fee();
                let Some(total) = tx.value.checked_add(fee) else {
                    return false;
                };
                if !state.debit(source, total) {
                    return false;
                }
                state.accounts.entry(source).or_default().nonce = tx.nonce;
                state.credit(tx.target, tx.value);
                state.credit(castor, fee);
                true
            }
            TxKind::Reward => {
                if source != castor || *reward_seen {
                    return false;
                }
                *reward_seen = true;
                state.credit(tx.target, tx.value);
                true
            }
        }
    }
}

impl StateProcessor for BasicProcessor {
    fn process(
        &self,
        state: &AccountState,
        header: &BlockHeader,
        txs: &[Transaction],
        proposing: bool,
    ) -> ExecuteOutput {
        let castor = header.castor_address();
        let mut next = state.clone();
        let mut evicted = Vec::new();
        let mut executed = Vec::with_capacity(txs.len());
        let mut receipts = Vec::with_capacity(txs.len());
        let mut gas_fee = 0u64;
        let mut reward_seen = false;

        for tx in txs {
            let ok = Self::apply(&mut next, castor, tx, &mut reward_seen);
            if !ok {
                evicted.push(tx.hash);
                if proposing {
                    continue;
                }
            }
            let gas_used = match (ok, tx.kind) {
                (true, TxKind::Transfer) => TX_GAS_UNITS,
                _ => 0,
            };
            if gas_used > 0 {
                gas_fee = gas_fee.saturating_add(tx.gas_fee());
            }
            receipts.push(Receipt {
                tx_hash: tx.hash,
                status: if ok { ReceiptStatus::Success } else { ReceiptStatus::Failed },
                gas_used,
                height: header.height,
                tx_index: executed.len() as u32,
            });
            executed.push(tx.clone());
        }

        ExecuteOutput {
            state_root: next.root(),
            state: next,
            evicted,
            executed,
            receipts,
            gas_fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn header_for(castor: &Keypair, height: u64) -> BlockHeader {
        BlockHeader {
            height,
            hash: Hash::ZERO,
            pre_hash: Hash::ZERO,
            state_tree: Hash::ZERO,
            tx_tree: Hash::ZERO,
            receipt_tree: Hash::ZERO,
            gas_fee: 0,
            total_qn: height,
            prove_value: vec![1],
            group_id: Hash::ZERO,
            castor: castor.public_key(),
            cur_time: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn transfer_moves_value_and_pays_castor() {
        let alice = Keypair::from_passphrase("alice");
        let bob = Keypair::from_passphrase("bob");
        let castor = Keypair::from_passphrase("castor");
        let state = AccountState::with_allocations([(alice.address(), 1_000_000)]);
        let tx = Transaction::transfer(&alice, 1, bob.address(), 400, 2);

        let out = BasicProcessor.process(&state, &header_for(&castor, 1), &[tx.clone()], false);
        assert!(out.evicted.is_empty());
        assert_eq!(out.gas_fee, 2 * TX_GAS_UNITS);
        assert_eq!(out.state.balance(&bob.address()), 400);
        assert_eq!(out.state.balance(&castor.address()), 2 * TX_GAS_UNITS);
        assert_eq!(out.state.balance(&alice.address()), 1_000_000 - 400 - 2 * TX_GAS_UNITS);
        assert_eq!(out.state.nonce(&alice.address()), 1);
        assert_eq!(out.state_root, out.state.root());
    }

    #[test]
    fn bad_nonce_is_evicted_when_proposing() {
        let alice = Keypair::from_passphrase("alice");
        let castor = Keypair::from_passphrase("castor");
        let state = AccountState::with_allocations([(alice.address(), 1_000_000)]);
        let good = Transaction::transfer(&alice, 1, Hash::ZERO, 1, 1);
        let gap = Transaction::transfer(&alice, 5, Hash::ZERO, 1, 1);

        let out = BasicProcessor.process(&state, &header_for(&castor, 1), &[good.clone(), gap.clone()], true);
        assert_eq!(out.executed, vec![good.clone()]);
        assert_eq!(out.evicted, vec![gap.hash]);

        let verify = BasicProcessor.process(&state, &header_for(&castor, 1), &[good, gap], false);
        assert_eq!(verify.executed.len(), 2);
        assert_eq!(verify.receipts[1].status, ReceiptStatus::Failed);
        assert_eq!(verify.state_root, out.state_root);
    }

    #[test]
    fn reward_only_from_castor() {
        let castor = Keypair::from_passphrase("castor");
        let other = Keypair::from_passphrase("other");
        let state = AccountState::default();
        let reward = Transaction::new_signed(TxKind::Reward, 0, 50, 0, castor.address(), b"h1".to_vec(), &castor);
        let forged = Transaction::new_signed(TxKind::Reward, 0, 50, 0, other.address(), b"h1".to_vec(), &other);

        let out = BasicProcessor.process(&state, &header_for(&castor, 1), &[reward, forged.clone()], true);
        assert_eq!(out.state.balance(&castor.address()), 50);
        assert_eq!(out.evicted, vec![forged.hash]);
    }

    #[test]
    fn process_is_deterministic() {
        let alice = Keypair::from_passphrase("alice");
        let castor = Keypair::from_passphrase("castor");
        let state = AccountState::with_allocations([(alice.address(), 10_000_000)]);
        let txs: Vec<_> = (1..=20)
            .map(|n| Transaction::transfer(&alice, n, Hash::digest(&n.to_be_bytes()), n * 3, 1))
            .collect();
        let h = header_for(&castor, 4);
        let a = BasicProcessor.process(&state, &h, &txs, false);
        let b = BasicProcessor.process(&state, &h, &txs, false);
        assert_eq!(a, b);
    }
}
