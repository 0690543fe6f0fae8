//! Fork session state machine.
//!
//! A session locates the common ancestor with one peer by sending pieces of
//! local hashes walking back from the head, then pulls the peer's branch
//! above the ancestor in slices. Transitions are plain functions of the
//! session, a read-only view of the local chain and the incoming event; they
//! return the next session and the effects for the processor to carry out.

use log::{debug, info, warn};

use super::candidates::CandidateTop;
use super::PeerId;
use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::BlockChain;
use crate::crypto::Hash;

/// What a session needs to know about the local chain.
pub trait ChainView {
    fn top(&self) -> BlockHeader;
    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader>;
    fn checkpoint_height(&self) -> u64;
}

impl ChainView for BlockChain {
    fn top(&self) -> BlockHeader {
        BlockChain::top(self)
    }

    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        BlockChain::header_by_hash(self, hash)
    }

    fn checkpoint_height(&self) -> u64 {
        BlockChain::checkpoint_height(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForkParams {
    /// Hashes per chain piece.
    pub piece_length: usize,
    /// Most blocks fetched above the ancestor.
    pub max_fork_blocks: u64,
}

#[derive(Debug, Clone)]
pub struct ForkContext {
    pub target: PeerId,
    pub target_top: CandidateTop,
    /// Deepest hash sent in the last piece.
    pub last_piece_tail: Hash,
    pub ancestor: Option<BlockHeader>,
    /// Exclusive end height of the fetch.
    pub end_height: u64,
    pub received: Vec<Block>,
    pub batch_size: u64,
}

impl ForkContext {
    fn next_height(&self) -> u64 {
        match (&self.ancestor, self.received.last()) {
            (_, Some(b)) => b.height() + 1,
            (Some(a), None) => a.height + 1,
            (None, None) => 0,
        }
    }

    fn tip_hash(&self) -> Option<Hash> {
        self.received
            .last()
            .map(|b| b.hash())
            .or_else(|| self.ancestor.as_ref().map(|a| a.hash))
    }

    /// The fetch stopped short of the peer's top.
    pub fn truncated(&self) -> bool {
        self.end_height < self.target_top.height() + 1
    }
}

#[derive(Debug, Clone, Default)]
pub enum ForkSession {
    #[default]
    Idle,
    AwaitingPiece(ForkContext),
    AwaitingBlocks(ForkContext),
}

#[derive(Debug, Clone)]
pub enum ForkAction {
    RequestPiece { peer: PeerId, hashes: Vec<Hash>, max_count: u64 },
    RequestSlice { peer: PeerId, begin: u64, end: u64 },
    ArmTimeout { peer: PeerId },
    CancelTimeout,
    Heard { peer: PeerId },
    Penalize { peer: PeerId },
    TimedOut { peer: PeerId },
    /// Verify and admit the fetched branch.
    Finish(Box<ForkContext>),
}

type Step = (ForkSession, Vec<ForkAction>);

/// Up to `len` hashes walking back from `from`, `from` included.
pub fn piece_from<V: ChainView + ?Sized>(view: &V, from: &BlockHeader, len: usize) -> Vec<Hash> {
    let mut hashes = Vec::with_capacity(len);
    let mut cursor = Some(from.clone());
    while let Some(h) = cursor {
        hashes.push(h.hash);
        if hashes.len() >= len || h.height == 0 {
            break;
        }
        cursor = view.header_by_hash(&h.pre_hash);
    }
    hashes
}

impl ForkSession {
    pub fn is_idle(&self) -> bool {
        matches!(self, ForkSession::Idle)
    }

    pub fn target(&self) -> Option<&PeerId> {
        match self {
            ForkSession::Idle => None,
            ForkSession::AwaitingPiece(c) | ForkSession::AwaitingBlocks(c) => Some(&c.target),
        }
    }

    /// Opens a session by sending the first piece from the local head.
    pub fn start<V: ChainView + ?Sized>(
        view: &V,
        target: PeerId,
        target_top: CandidateTop,
        batch_size: u64,
        params: ForkParams,
    ) -> Step {
        let top = view.top();
        let hashes = piece_from(view, &top, params.piece_length);
        let last_piece_tail = hashes.last().copied().unwrap_or(top.hash);
        info!(
            "[fork] looking for common ancestor with {} (their top {}, ours {})",
            target,
            target_top.height(),
            top.height
        );
        let ctx = ForkContext {
            target: target.clone(),
            target_top,
            last_piece_tail,
            ancestor: None,
            end_height: 0,
            received: Vec::new(),
            batch_size,
        };
        let actions = vec![
            ForkAction::RequestPiece {
                peer: target.clone(),
                hashes,
                max_count: batch_size,
            },
            ForkAction::ArmTimeout { peer: target },
        ];
        (ForkSession::AwaitingPiece(ctx), actions)
    }

    pub fn on_piece<V: ChainView + ?Sized>(
        self,
        view: &V,
        source: &PeerId,
        top_header: BlockHeader,
        found: bool,
        blocks: Vec<Block>,
        params: ForkParams,
    ) -> Step {
        let ForkSession::AwaitingPiece(mut ctx) = self else {
            debug!("[fork] piece from {} outside a piece wait", source);
            return (self, Vec::new());
        };

        let mut actions = Vec::new();
        if *source != ctx.target {
            let wanted = ctx.target_top.header.hash;
            let relevant = top_header.hash == wanted || blocks.iter().any(|b| b.hash() == wanted);
            if !relevant {
                debug!("[fork] discarding piece from {}, tracking {}", source, ctx.target);
                return (ForkSession::AwaitingPiece(ctx), Vec::new());
            }
            actions.push(ForkAction::CancelTimeout);
            ctx.target = source.clone();
        }
        actions.push(ForkAction::Heard { peer: source.clone() });

        if top_header.hash_matches() && top_header.weight() > ctx.target_top.weight {
            ctx.target_top = CandidateTop::new(top_header);
        }

        if !found {
            return Self::walk_deeper(view, ctx, actions, params);
        }

        let ancestor = match blocks.first().and_then(|b| view.header_by_hash(&b.hash())) {
            Some(a) => a,
            None => {
                warn!("[fork] {} claimed an ancestor we do not have", source);
                actions.push(ForkAction::Penalize { peer: source.clone() });
                actions.push(ForkAction::CancelTimeout);
                return (ForkSession::Idle, actions);
            }
        };
        let checkpoint = view.checkpoint_height();
        if ancestor.height < checkpoint {
            warn!(
                "[fork] ancestor {} with {} below checkpoint {}, refusing deep fork",
                ancestor.height, source, checkpoint
            );
            actions.push(ForkAction::CancelTimeout);
            return (ForkSession::Idle, actions);
        }

        info!("[fork] common ancestor with {} at {}", source, ancestor.height);
        ctx.end_height = (ctx.target_top.height() + 1).min(ancestor.height + 1 + params.max_fork_blocks);
        ctx.ancestor = Some(ancestor);
        ctx.received.clear();
        Self::absorb(&mut ctx, blocks.into_iter().skip(1));
        Self::next_slice_or_finish(ctx, actions)
    }

    fn walk_deeper<V: ChainView + ?Sized>(
        view: &V,
        mut ctx: ForkContext,
        mut actions: Vec<ForkAction>,
        params: ForkParams,
    ) -> Step {
        let checkpoint = view.checkpoint_height();
        let next = view
            .header_by_hash(&ctx.last_piece_tail)
            .filter(|tail| tail.height > checkpoint && tail.height > 0)
            .and_then(|tail| view.header_by_hash(&tail.pre_hash));
        let Some(next) = next else {
            info!("[fork] no common ancestor with {} above checkpoint {}", ctx.target, checkpoint);
            actions.push(ForkAction::CancelTimeout);
            return (ForkSession::Idle, actions);
        };
        let hashes = piece_from(view, &next, params.piece_length);
        ctx.last_piece_tail = hashes.last().copied().unwrap_or(next.hash);
        debug!("[fork] walking back from {} with {}", next.height, ctx.target);
        actions.push(ForkAction::RequestPiece {
            peer: ctx.target.clone(),
            hashes,
            max_count: ctx.batch_size,
        });
        actions.push(ForkAction::ArmTimeout { peer: ctx.target.clone() });
        (ForkSession::AwaitingPiece(ctx), actions)
    }

    pub fn on_slice(self, source: &PeerId, blocks: Vec<Block>) -> Step {
        let ForkSession::AwaitingBlocks(mut ctx) = self else {
            debug!("[fork] slice from {} outside a block wait", source);
            return (self, Vec::new());
        };
        if *source != ctx.target {
            return (ForkSession::AwaitingBlocks(ctx), Vec::new());
        }
        let actions = vec![ForkAction::Heard { peer: source.clone() }];
        let before = ctx.received.len();
        Self::absorb(&mut ctx, blocks.into_iter());
        if ctx.received.len() == before {
            debug!("[fork] {} sent nothing usable, finishing with {} blocks", source, before);
            return Self::finish(ctx, actions);
        }
        Self::next_slice_or_finish(ctx, actions)
    }

    pub fn on_timeout(self, peer: &PeerId) -> Step {
        match self.target() {
            Some(t) if t == peer => {
                warn!("[fork] session with {} timed out", peer);
                (ForkSession::Idle, vec![ForkAction::TimedOut { peer: peer.clone() }])
            }
            _ => (self, Vec::new()),
        }
    }

    /// Appends blocks that extend the fetched run, up to the end height.
    fn absorb(ctx: &mut ForkContext, blocks: impl Iterator<Item = Block>) {
        for block in blocks {
            if block.height() != ctx.next_height() || Some(block.pre_hash()) != ctx.tip_hash() {
                break;
            }
            if block.height() >= ctx.end_height {
                break;
            }
            ctx.received.push(block);
        }
    }

    fn next_slice_or_finish(ctx: ForkContext, mut actions: Vec<ForkAction>) -> Step {
        let begin = ctx.next_height();
        if begin >= ctx.end_height {
            return Self::finish(ctx, actions);
        }
        let end = (begin + ctx.batch_size.max(1)).min(ctx.end_height);
        actions.push(ForkAction::RequestSlice {
            peer: ctx.target.clone(),
            begin,
            end,
        });
        actions.push(ForkAction::ArmTimeout { peer: ctx.target.clone() });
        (ForkSession::AwaitingBlocks(ctx), actions)
    }

    fn finish(ctx: ForkContext, mut actions: Vec<ForkAction>) -> Step {
        actions.push(ForkAction::CancelTimeout);
        actions.push(ForkAction::Finish(Box::new(ctx)));
        (ForkSession::Idle, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Linear {
        headers: Vec<BlockHeader>,
        by_hash: HashMap<Hash, usize>,
        checkpoint: u64,
    }

    fn header(height: u64, pre: Hash, tag: u8) -> BlockHeader {
        let mut h = BlockHeader {
            height,
            hash: Hash::ZERO,
            pre_hash: pre,
            state_tree: Hash::ZERO,
            tx_tree: Hash::ZERO,
            receipt_tree: Hash::ZERO,
            gas_fee: 0,
            total_qn: height,
            prove_value: vec![tag],
            group_id: Hash::ZERO,
            castor: Vec::new(),
            cur_time: height as i64,
            signature: Vec::new(),
        };
        h.hash = h.compute_hash();
        h
    }

    fn linear(len: u64, checkpoint: u64) -> Linear {
        let mut headers = Vec::new();
        let mut pre = Hash::ZERO;
        for h in 0..len {
            let hd = header(h, pre, 0);
            pre = hd.hash;
            headers.push(hd);
        }
        let by_hash = headers.iter().enumerate().map(|(i, h)| (h.hash, i)).collect();
        Linear {
            headers,
            by_hash,
            checkpoint,
        }
    }

    impl ChainView for Linear {
        fn top(&self) -> BlockHeader {
            self.headers[self.headers.len() - 1].clone()
        }
        fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
            self.by_hash.get(hash).map(|&i| self.headers[i].clone())
        }
        fn checkpoint_height(&self) -> u64 {
            self.checkpoint
        }
    }

    fn block(h: BlockHeader) -> Block {
        Block {
            header: h,
            transactions: Vec::new(),
        }
    }

    const PARAMS: ForkParams = ForkParams {
        piece_length: 10,
        max_fork_blocks: 2000,
    };

    fn remote_branch(view: &Linear, from: u64, to: u64) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut pre = view.headers[from as usize].hash;
        for h in from + 1..=to {
            let hd = header(h, pre, 9);
            pre = hd.hash;
            out.push(hd);
        }
        out
    }

    #[test]
    fn piece_walks_back_from_head() {
        let view = linear(25, 0);
        let hashes = piece_from(&view, &view.top(), 10);
        assert_eq!(hashes.len(), 10);
        assert_eq!(hashes[0], view.headers[24].hash);
        assert_eq!(hashes[9], view.headers[15].hash);
        let short = piece_from(&view, &view.headers[3], 10);
        assert_eq!(short.len(), 4);
    }

    #[test]
    fn found_ancestor_then_slices_then_finish() {
        let view = linear(30, 0);
        let branch = remote_branch(&view, 26, 50);
        let target_top = CandidateTop::new(branch.last().unwrap().clone());
        let peer = "remote".to_string();

        let (s, actions) = ForkSession::start(&view, peer.clone(), target_top, 16, PARAMS);
        assert!(matches!(actions[0], ForkAction::RequestPiece { ref hashes, .. } if hashes.len() == 10));

        let mut blocks = vec![block(view.headers[26].clone())];
        blocks.extend(branch[..16].iter().cloned().map(block));
        let (s, actions) = s.on_piece(&view, &peer, branch.last().unwrap().clone(), true, blocks, PARAMS);
        let ForkSession::AwaitingBlocks(ctx) = &s else {
            panic!("expected slice wait, got {s:?}");
        };
        assert_eq!(ctx.end_height, 51);
        assert_eq!(ctx.received.len(), 16);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ForkAction::RequestSlice { begin: 43, end: 51, .. })));

        let rest = branch[16..].iter().cloned().map(block).collect();
        let (s, actions) = s.on_slice(&peer, rest);
        assert!(s.is_idle());
        let Some(ForkAction::Finish(ctx)) = actions.last() else {
            panic!("expected finish");
        };
        assert_eq!(ctx.received.len(), 24);
        assert!(!ctx.truncated());
    }

    #[test]
    fn not_found_stops_at_checkpoint() {
        let view = linear(40, 25);
        let peer = "remote".to_string();
        let top = CandidateTop::new(header(60, Hash::digest(b"elsewhere"), 3));
        let (s, _) = ForkSession::start(&view, peer.clone(), top.clone(), 16, PARAMS);

        // 39..30 sent, next piece starts at 29
        let (s, actions) = s.on_piece(&view, &peer, top.header.clone(), false, Vec::new(), PARAMS);
        assert!(matches!(
            actions.iter().find(|a| matches!(a, ForkAction::RequestPiece { .. })),
            Some(ForkAction::RequestPiece { hashes, .. }) if hashes[0] == view.headers[29].hash
        ));
        // 29..20 sent, tail at 20 is at or below the checkpoint
        let (s, actions) = s.on_piece(&view, &peer, top.header, false, Vec::new(), PARAMS);
        assert!(s.is_idle());
        assert!(actions.iter().any(|a| matches!(a, ForkAction::CancelTimeout)));
        assert!(!actions.iter().any(|a| matches!(a, ForkAction::RequestPiece { .. })));
    }

    #[test]
    fn unknown_claimed_ancestor_penalises() {
        let view = linear(10, 0);
        let peer = "liar".to_string();
        let top = CandidateTop::new(header(20, Hash::digest(b"x"), 1));
        let (s, _) = ForkSession::start(&view, peer.clone(), top.clone(), 16, PARAMS);
        let bogus = vec![block(header(5, Hash::digest(b"nowhere"), 7))];
        let (s, actions) = s.on_piece(&view, &peer, top.header, true, bogus, PARAMS);
        assert!(s.is_idle());
        assert!(actions.iter().any(|a| matches!(a, ForkAction::Penalize { .. })));
    }

    #[test]
    fn unrelated_source_is_ignored() {
        let view = linear(10, 0);
        let top = CandidateTop::new(header(20, Hash::digest(b"x"), 1));
        let (s, _) = ForkSession::start(&view, "a".into(), top, 16, PARAMS);
        let other_top = header(30, Hash::digest(b"y"), 2);
        let (s, actions) = s.on_piece(&view, &"b".to_string(), other_top, false, Vec::new(), PARAMS);
        assert!(actions.is_empty());
        assert_eq!(s.target().map(String::as_str), Some("a"));
    }

    #[test]
    fn deep_ancestor_is_refused() {
        let view = linear(30, 20);
        let branch = remote_branch(&view, 10, 40);
        let top = CandidateTop::new(branch.last().unwrap().clone());
        let peer = "remote".to_string();
        let (s, _) = ForkSession::start(&view, peer.clone(), top.clone(), 16, PARAMS);
        let blocks = vec![block(view.headers[10].clone()), block(branch[0].clone())];
        let (s, actions) = s.on_piece(&view, &peer, top.header, true, blocks, PARAMS);
        assert!(s.is_idle());
        assert!(!actions.iter().any(|a| matches!(a, ForkAction::Finish(_))));
    }

    #[test]
    fn fetch_is_capped_and_marked_truncated() {
        let view = linear(10, 0);
        let branch = remote_branch(&view, 5, 40);
        let top = CandidateTop::new(branch.last().unwrap().clone());
        let peer = "remote".to_string();
        let params = ForkParams {
            piece_length: 10,
            max_fork_blocks: 8,
        };
        let (s, _) = ForkSession::start(&view, peer.clone(), top.clone(), 16, params);
        let mut blocks = vec![block(view.headers[5].clone())];
        blocks.extend(branch[..16].iter().cloned().map(block));
        let (s, actions) = s.on_piece(&view, &peer, top.header, true, blocks, params);
        assert!(s.is_idle());
        let Some(ForkAction::Finish(ctx)) = actions.last() else {
            panic!("expected finish");
        };
        assert_eq!(ctx.end_height, 14);
        assert_eq!(ctx.received.len(), 8);
        assert!(ctx.truncated());
    }

    #[test]
    fn timeout_only_for_current_target() {
        let view = linear(5, 0);
        let top = CandidateTop::new(header(20, Hash::digest(b"x"), 1));
        let (s, _) = ForkSession::start(&view, "a".into(), top, 16, PARAMS);
        let (s, actions) = s.on_timeout(&"b".to_string());
        assert!(!s.is_idle());
        assert!(actions.is_empty());
        let (s, actions) = s.on_timeout(&"a".to_string());
        assert!(s.is_idle());
        assert!(matches!(actions[0], ForkAction::TimedOut { .. }));
    }
}
