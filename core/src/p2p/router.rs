use std::sync::Arc;

use log::{debug, warn};

use super::fork::ForkProcessor;
use super::group_sync::GroupSyncer;
use super::messages::Message;
use super::peers::PeerManager;
use super::sync::BlockSyncer;
use super::tx_sync::TxSyncer;
use super::{MessageHandler, PeerId, ProtocolError};
use crate::blockchain::BlockChain;

/// Dispatches inbound messages to the protocol handlers.
pub struct Router {
    chain: Arc<BlockChain>,
    peers: Arc<PeerManager>,
    syncer: Arc<BlockSyncer>,
    fork: Arc<ForkProcessor>,
    groups: Arc<GroupSyncer>,
    txs: Arc<TxSyncer>,
}

impl Router {
    pub fn new(
        chain: Arc<BlockChain>,
        peers: Arc<PeerManager>,
        syncer: Arc<BlockSyncer>,
        fork: Arc<ForkProcessor>,
        groups: Arc<GroupSyncer>,
        txs: Arc<TxSyncer>,
    ) -> Self {
        Self {
            chain,
            peers,
            syncer,
            fork,
            groups,
            txs,
        }
    }

    fn dispatch(&self, source: &PeerId, msg: Message) -> Result<(), ProtocolError> {
        match msg {
            Message::Handshake { .. } => {
                self.peers.heard_from_peer(source);
                Ok(())
            }
            Message::TopBlockAnnounce { header } => self.syncer.on_top_announce(source, header),
            Message::NewBlock { block } => {
                if self.peers.is_banned(source) {
                    return Err(ProtocolError::Banned(source.clone()));
                }
                self.peers.heard_from_peer(source);
                let result = self.chain.add_block(Some(source), block);
                debug!("[p2p] new block from {}: {:?}", source, result);
                Ok(())
            }
            Message::BlockRangeRequest {
                start_height,
                max_count,
            } => self.syncer.on_range_request(source, start_height, max_count),
            Message::BlockRangeResponse { blocks } => self.syncer.on_range_response(source, blocks),
            Message::ChainPieceRequest { hashes, max_count } => self.fork.on_piece_request(source, hashes, max_count),
            Message::ChainPieceResponse {
                top_header,
                found_ancestor,
                blocks,
            } => {
                self.fork.on_piece_response(source, top_header, found_ancestor, blocks);
                Ok(())
            }
            Message::ChainSliceRequest { begin, end } => self.fork.on_slice_request(source, begin, end),
            Message::ChainSliceResponse { blocks } => {
                self.fork.on_slice_response(source, blocks);
                Ok(())
            }
            Message::GroupHeightAnnounce { height } => self.groups.on_height_announce(source, height),
            Message::GroupRangeRequest {
                start_height,
                max_count,
            } => self.groups.on_range_request(source, start_height, max_count),
            Message::GroupRangeResponse { groups } => {
                self.groups.on_range_response(source, groups);
                Ok(())
            }
            Message::TxAnnounce { hashes } => self.txs.on_tx_announce(source, hashes),
            Message::TxRequest { hashes } => self.txs.on_tx_request(source, hashes),
            Message::TxResponse { txs } => self.txs.on_tx_response(source, txs),
        }
    }
}

impl MessageHandler for Router {
    fn handle(&self, source: PeerId, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.dispatch(&source, msg) {
            warn!("[p2p] {} from {} rejected: {}", kind, source, e);
        }
    }
}
