use log::info;

use super::block::{receipt_tree, tx_tree, Block, BlockHeader};
use super::BlockChain;
use crate::crypto::{Hash, Keypair};

impl BlockChain {
    /// Builds and signs a block on top of the current head from pool
    /// transactions. The execution result is cached, so admitting the
    /// returned block does not execute it again.
    ///
    /// The block is not admitted; pass it to `add_block`.
    pub fn cast_block(&self, castor: &Keypair, group_id: Hash) -> Block {
        let (top, state) = {
            let head = self.head.read();
            (head.header.clone(), head.state.clone())
        };
        let candidates = self.pool.pack_for_cast(self.config.max_txs_per_block);

        let mut seed = Vec::with_capacity(40);
        seed.extend_from_slice(top.hash.as_bytes());
        seed.extend_from_slice(&(top.height + 1).to_be_bytes());
        let prove_value = Hash::digest(&castor.sign(&seed)).0.to_vec();

        let now = chrono::Utc::now().timestamp_millis();
        let mut header = BlockHeader {
            height: top.height + 1,
            hash: Hash::ZERO,
            pre_hash: top.hash,
            state_tree: Hash::ZERO,
            tx_tree: Hash::ZERO,
            receipt_tree: Hash::ZERO,
            gas_fee: 0,
            total_qn: top.total_qn + self.config.qn_per_block,
            prove_value,
            group_id,
            castor: castor.public_key(),
            cur_time: now.max(top.cur_time),
            signature: Vec::new(),
        };

        let output = self.processor.process(&state, &header, &candidates, true);
        if !output.evicted.is_empty() {
            self.pool.remove_from_pool(&output.evicted);
        }
        header.tx_tree = tx_tree(&output.executed);
        header.gas_fee = output.gas_fee;
        header.state_tree = output.state_root;
        header.receipt_tree = receipt_tree(&output.receipts);
        header.seal(castor);

        let block = Block {
            header,
            transactions: output.executed.clone(),
        };
        info!(
            "[chain] cast block {} at height {} with {} txs",
            block.hash().short(),
            block.height(),
            block.transactions.len()
        );
        self.verified_blocks.lock().insert(block.hash(), output);
        block
    }
}
