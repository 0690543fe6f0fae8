use crate::blockchain::block::{Block, BlockHeader};
use crate::p2p::PeerId;

/// Observers of chain head movement. Called after the chain's decision lock
/// is released, except `on_block_removed`/`on_new_top` during a reset.
/// Implementations must not re-enter block admission synchronously.
pub trait ChainListener: Send + Sync {
    fn on_block_added(&self, _block: &Block) {}
    fn on_new_top(&self, _top: &BlockHeader) {}
    fn on_block_removed(&self, _header: &BlockHeader) {}
}

/// Where the chain head sends work it cannot finish itself. Implementations
/// hand the work to a spawner and return immediately.
pub trait OrphanHandler: Send + Sync {
    /// A block whose parent is unknown but whose height says we may be on a
    /// different branch.
    fn on_fork_suspected(&self, source: PeerId, block: Block);

    /// A block from far ahead of the local head. `top` is that block's
    /// header, a lower bound on the source's chain.
    fn on_behind(&self, source: PeerId, top: BlockHeader);

    /// Consensus verification needs a group we do not have yet.
    fn on_group_missing(&self, source: Option<PeerId>);
}
