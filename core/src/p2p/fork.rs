//! Fork processor: drives [`ForkSession`] against the network and the
//! chain, and serves the remote side of piece and slice requests.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::candidates::CandidateTop;
use super::fork_session::{ForkAction, ForkContext, ForkParams, ForkSession};
use super::messages::Message;
use super::peers::PeerManager;
use super::sync::BlockSyncer;
use super::{PeerId, ProtocolError, Transport};
use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::BlockChain;
use crate::common::Ticker;
use crate::config::ForkConfig;
use crate::crypto::Hash;

const TIMEOUT_ROUTINE: &str = "fork_timeout";

pub struct ForkProcessor {
    me: Weak<ForkProcessor>,
    config: ForkConfig,
    max_request_blocks: u64,
    chain: Arc<BlockChain>,
    peers: Arc<PeerManager>,
    syncer: Arc<BlockSyncer>,
    transport: Arc<dyn Transport>,
    ticker: Arc<Ticker>,
    session: Mutex<ForkSession>,
}

impl ForkProcessor {
    pub fn new(
        config: ForkConfig,
        max_request_blocks: u64,
        chain: Arc<BlockChain>,
        peers: Arc<PeerManager>,
        syncer: Arc<BlockSyncer>,
        transport: Arc<dyn Transport>,
        ticker: Arc<Ticker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            max_request_blocks,
            chain,
            peers,
            syncer,
            transport,
            ticker,
            session: Mutex::new(ForkSession::Idle),
        })
    }

    fn params(&self) -> ForkParams {
        ForkParams {
            piece_length: self.config.piece_length,
            max_fork_blocks: self.config.max_fork_blocks,
        }
    }

    pub fn is_processing(&self) -> bool {
        !self.session.lock().is_idle()
    }

    /// Starts resolving a fork with `source`, whose `block` did not attach to
    /// the local chain. Returns false when the peer's branch is not heavier
    /// or a session is already running.
    pub fn try_to_process_fork(&self, source: &PeerId, block: Block) -> bool {
        if self.chain.has_block(&block.pre_hash()) {
            debug!("[fork] parent of {} arrived meanwhile, admitting", block.hash().short());
            self.chain.add_block(Some(source), block);
            return true;
        }

        let mut target = CandidateTop::new(block.header);
        if let Some(announced) = self.syncer.candidate_top(source) {
            if announced.weight > target.weight {
                target = announced;
            }
        }
        if target.weight <= self.chain.top_weight() {
            debug!("[fork] {}'s branch at {} is not heavier, ignoring", source, target.height());
            return false;
        }

        let actions = {
            let mut session = self.session.lock();
            if !session.is_idle() {
                debug!("[fork] session with {:?} running, ignoring {}", session.target(), source);
                return false;
            }
            let batch = self.peers.get_peer_req_block_count(source);
            let (next, actions) = ForkSession::start(self.chain.as_ref(), source.clone(), target, batch, self.params());
            *session = next;
            actions
        };
        self.execute(actions);
        true
    }

    pub fn on_piece_request(&self, source: &PeerId, hashes: Vec<Hash>, max_count: u64) -> Result<(), ProtocolError> {
        if hashes.is_empty() {
            return Err(ProtocolError::EmptyPiece);
        }
        let count = max_count.min(self.max_request_blocks) as usize;
        let top_header = self.chain.top();
        let (found_ancestor, blocks) = match self.chain.first_known(&hashes) {
            Some(ancestor) => (true, self.chain.blocks_after_height(ancestor.height, count + 1)),
            None => (false, Vec::new()),
        };
        debug!(
            "[fork] piece request from {}: found={} sending {} blocks",
            source,
            found_ancestor,
            blocks.len()
        );
        self.transport.send(
            source,
            Message::ChainPieceResponse {
                top_header,
                found_ancestor,
                blocks,
            },
        );
        Ok(())
    }

    pub fn on_piece_response(&self, source: &PeerId, top_header: BlockHeader, found: bool, blocks: Vec<Block>) {
        let params = self.params();
        let actions = {
            let mut session = self.session.lock();
            let current = std::mem::take(&mut *session);
            let (next, actions) = current.on_piece(self.chain.as_ref(), source, top_header, found, blocks, params);
            *session = next;
            actions
        };
        self.execute(actions);
    }

    pub fn on_slice_request(&self, source: &PeerId, begin: u64, end: u64) -> Result<(), ProtocolError> {
        let local = self.chain.height();
        if end <= begin || begin > local || end - begin > self.max_request_blocks {
            return Err(ProtocolError::InvalidSlice { begin, end, local });
        }
        let blocks = self.chain.blocks_between(begin, end);
        self.transport.send(source, Message::ChainSliceResponse { blocks });
        Ok(())
    }

    pub fn on_slice_response(&self, source: &PeerId, blocks: Vec<Block>) {
        let actions = {
            let mut session = self.session.lock();
            let current = std::mem::take(&mut *session);
            let (next, actions) = current.on_slice(source, blocks);
            *session = next;
            actions
        };
        self.execute(actions);
    }

    pub fn on_timeout(&self, peer: &PeerId) {
        let actions = {
            let mut session = self.session.lock();
            let current = std::mem::take(&mut *session);
            let (next, actions) = current.on_timeout(peer);
            *session = next;
            actions
        };
        self.execute(actions);
    }

    /// Carries out session effects. Never called with the session lock held.
    fn execute(&self, actions: Vec<ForkAction>) {
        for action in actions {
            match action {
                ForkAction::RequestPiece { peer, hashes, max_count } => {
                    self.transport.send(&peer, Message::ChainPieceRequest { hashes, max_count });
                }
                ForkAction::RequestSlice { peer, begin, end } => {
                    self.transport.send(&peer, Message::ChainSliceRequest { begin, end });
                }
                ForkAction::ArmTimeout { peer } => {
                    let me = self.me.clone();
                    self.ticker
                        .register_one_time(TIMEOUT_ROUTINE, self.config.timeout_ticks, move || {
                            if let Some(f) = me.upgrade() {
                                f.on_timeout(&peer);
                            }
                        });
                }
                ForkAction::CancelTimeout => {
                    self.ticker.remove(TIMEOUT_ROUTINE);
                }
                ForkAction::Heard { peer } => self.peers.heard_from_peer(&peer),
                ForkAction::Penalize { peer } => self.peers.add_evil_count(&peer),
                ForkAction::TimedOut { peer } => {
                    self.peers.timeout_peer(&peer);
                    self.peers.update_req_block_count(&peer, false);
                }
                ForkAction::Finish(ctx) => self.finish(*ctx),
            }
        }
    }

    /// Verifies the fetched branch and admits it if it outweighs ours.
    fn finish(&self, ctx: ForkContext) {
        let peer = ctx.target.clone();
        let Some(ancestor) = ctx.ancestor.as_ref() else {
            return;
        };
        if !self.chain.has_block(&ancestor.hash) {
            info!("[fork] ancestor {} vanished, dropping branch from {}", ancestor.height, peer);
            return;
        }
        let Some(last) = ctx.received.last() else {
            debug!("[fork] {} sent no blocks above the ancestor", peer);
            return;
        };

        let consensus = self.chain.consensus();
        let mut parent = ancestor.clone();
        for block in &ctx.received {
            if block.height() >= ctx.end_height {
                warn!("[fork] block {} from {} beyond the fetch end", block.height(), peer);
                self.peers.add_evil_count(&peer);
                return;
            }
            if let Err(e) = consensus.verify_block_headers(&parent, &block.header) {
                warn!("[fork] bad header at {} from {}: {}", block.height(), peer, e);
                self.peers.add_evil_count(&peer);
                return;
            }
            parent = block.header.clone();
        }

        let local = if ctx.truncated() {
            self.chain.header_by_height(last.height()).unwrap_or_else(|| self.chain.top())
        } else {
            self.chain.top()
        };
        if last.header.weight() <= local.weight() {
            info!(
                "[fork] branch from {} ending at {} is not heavier than ours at {}",
                peer,
                last.height(),
                local.height
            );
            return;
        }

        info!(
            "[fork] adopting {} blocks from {} above ancestor {}",
            ctx.received.len(),
            peer,
            ancestor.height
        );
        if let Err(e) = self
            .chain
            .batch_add(Some(&peer), "fork", ctx.received, |_, result| result.is_ok())
        {
            warn!("[fork] admitting branch from {} failed: {}", peer, e);
            return;
        }

        if ctx.target_top.weight > self.chain.top_weight() {
            debug!("[fork] {} still heavier, handing over to sync", peer);
            self.syncer.add_candidate(peer.clone(), ctx.target_top);
            self.syncer.sync_from(&peer);
        }
    }
}
