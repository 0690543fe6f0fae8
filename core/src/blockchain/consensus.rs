//! Header verification seam.
//!
//! Group election and threshold signing live outside this crate; what the
//! chain head needs is expressed by [`ConsensusHelper`]. `BasicConsensus`
//! checks linkage, qn growth, time and the castor signature, and requires
//! the casting group to be on the local group chain.

use std::sync::Arc;

use thiserror::Error;

use crate::blockchain::block::BlockHeader;
use crate::crypto::Hash;
use crate::groups::GroupChain;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("block {hash} does not link to parent {parent}")]
    ParentMismatch { hash: Hash, parent: Hash },
    #[error("height {got} does not follow parent height {parent}")]
    BadHeight { parent: u64, got: u64 },
    #[error("total qn {got} not above parent {parent}")]
    QnNotIncreasing { parent: u64, got: u64 },
    #[error("block time {got} before parent time {parent}")]
    TimeRegressed { parent: i64, got: i64 },
    #[error("header {0} hash or signature invalid")]
    BadSignature(Hash),
    #[error("group {0} unknown")]
    MissingGroup(Hash),
    #[error("group {group} created at {create_height}, cannot cast height {height}")]
    GroupTooYoung { group: Hash, create_height: u64, height: u64 },
    #[error("castor is not a member of group {0}")]
    NotGroupMember(Hash),
}

pub trait ConsensusHelper: Send + Sync {
    /// Full check of a new block header against its parent.
    fn verify_new_block(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), ConsensusError>;

    /// Linkage and signature checks used on fork pieces, without group lookups.
    fn verify_block_headers(&self, parent: &BlockHeader, header: &BlockHeader) -> Result<(), ConsensusError>;

    fn verify_header_sign(&self, header: &BlockHeader) -> bool;

    /// Height the parent of `header` should have.
    fn estimate_pre_height(&self, header: &BlockHeader) -> u64;
}

pub struct BasicConsensus {
    groups: Arc<GroupChain>,
}

impl BasicConsensus {
    pub fn new(groups: Arc<GroupChain>) -> Self {
        Self { groups }
    }

    fn check_link(parent: &BlockHeader, header: &BlockHeader) -> Result<(), ConsensusError> {
        if header.pre_hash != parent.hash {
            return Err(ConsensusError::ParentMismatch {
                hash: header.hash,
                parent: parent.hash,
            });
        }
        if header.height != parent.height + 1 {
            return Err(ConsensusError::BadHeight {
                parent: parent.height,
                got: header.height,
            });
        }
        if header.total_qn <= parent.total_qn {
            return Err(ConsensusError::QnNotIncreasing {
                parent: parent.total_qn,
                got: header.total_qn,
            });
        }
        if header.cur_time < parent.cur_time {
            return Err(ConsensusError::TimeRegressed {
                parent: parent.cur_time,
                got: header.cur_time,
            });
        }
        Ok(())
    }
}

impl ConsensusHelper for BasicConsensus {
    fn verify_new_block(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), ConsensusError> {
        self.verify_block_headers(parent, header)?;
        let group = self
            .groups
            .get_by_id(&header.group_id)
            .ok_or(ConsensusError::MissingGroup(header.group_id))?;
        if group.create_height >= header.height && header.height > 0 {
            return Err(ConsensusError::GroupTooYoung {
                group: group.id,
                create_height: group.create_height,
                height: header.height,
            });
        }
        if !group.members.is_empty() && !group.members.iter().any(|m| *m == header.castor) {
            return Err(ConsensusError::NotGroupMember(group.id));
        }
        Ok(())
    }

    fn verify_block_headers(&self, parent: &BlockHeader, header: &BlockHeader) -> Result<(), ConsensusError> {
        Self::check_link(parent, header)?;
        if !self.verify_header_sign(header) {
            return Err(ConsensusError::BadSignature(header.hash));
        }
        Ok(())
    }

    fn verify_header_sign(&self, header: &BlockHeader) -> bool {
        header.hash_matches() && header.signature_valid()
    }

    fn estimate_pre_height(&self, header: &BlockHeader) -> u64 {
        header.height.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::groups::Group;

    fn child_of(parent: &BlockHeader, group: Hash, castor: &Keypair) -> BlockHeader {
        let mut h = BlockHeader {
            height: parent.height + 1,
            hash: Hash::ZERO,
            pre_hash: parent.hash,
            state_tree: parent.state_tree,
            tx_tree: parent.tx_tree,
            receipt_tree: parent.receipt_tree,
            gas_fee: 0,
            total_qn: parent.total_qn + 1,
            prove_value: vec![7],
            group_id: group,
            castor: Vec::new(),
            cur_time: parent.cur_time + 1,
            signature: Vec::new(),
        };
        h.seal(castor);
        h
    }

    fn setup() -> (Arc<GroupChain>, Group, BlockHeader) {
        let genesis_group = GroupChain::genesis_group("c", Vec::new());
        let groups = Arc::new(GroupChain::new(genesis_group.clone()));
        let mut root = child_of(
            &BlockHeader {
                height: 0,
                hash: Hash::ZERO,
                pre_hash: Hash::ZERO,
                state_tree: Hash::ZERO,
                tx_tree: Hash::ZERO,
                receipt_tree: Hash::ZERO,
                gas_fee: 0,
                total_qn: 0,
                prove_value: Vec::new(),
                group_id: Hash::ZERO,
                castor: Vec::new(),
                cur_time: 0,
                signature: Vec::new(),
            },
            genesis_group.id,
            &Keypair::from_passphrase("root"),
        );
        root.height = 0;
        root.seal(&Keypair::from_passphrase("root"));
        (groups, genesis_group, root)
    }

    #[test]
    fn accepts_linked_signed_header() {
        let (groups, g, root) = setup();
        let consensus = BasicConsensus::new(groups);
        let child = child_of(&root, g.id, &Keypair::from_passphrase("castor"));
        assert_eq!(consensus.verify_new_block(&child, &root), Ok(()));
        assert_eq!(consensus.estimate_pre_height(&child), 0);
    }

    #[test]
    fn unknown_group_is_reported() {
        let (groups, _g, root) = setup();
        let consensus = BasicConsensus::new(groups);
        let stranger = Hash::digest(b"stranger");
        let child = child_of(&root, stranger, &Keypair::from_passphrase("castor"));
        assert_eq!(consensus.verify_new_block(&child, &root), Err(ConsensusError::MissingGroup(stranger)));
        assert_eq!(consensus.verify_block_headers(&root, &child), Ok(()));
    }

    #[test]
    fn forged_signature_rejected() {
        let (groups, g, root) = setup();
        let consensus = BasicConsensus::new(groups);
        let mut child = child_of(&root, g.id, &Keypair::from_passphrase("castor"));
        child.signature = Keypair::from_passphrase("other").sign(child.hash.as_bytes());
        assert_eq!(
            consensus.verify_new_block(&child, &root),
            Err(ConsensusError::BadSignature(child.hash))
        );
    }

    #[test]
    fn qn_must_grow() {
        let (groups, g, root) = setup();
        let consensus = BasicConsensus::new(groups);
        let castor = Keypair::from_passphrase("castor");
        let mut child = child_of(&root, g.id, &castor);
        child.total_qn = root.total_qn;
        child.seal(&castor);
        assert!(matches!(
            consensus.verify_new_block(&child, &root),
            Err(ConsensusError::QnNotIncreasing { .. })
        ));
    }
}
