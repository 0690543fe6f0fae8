use serde::{Deserialize, Serialize};

use crate::blockchain::block::{Block, BlockHeader};
use crate::crypto::Hash;
use crate::groups::Group;
use crate::tx::Transaction;

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Everything peers say to each other. Externally tagged so bincode can
/// carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Handshake { node_id: String, version: u32 },

    // Gossip
    TopBlockAnnounce { header: BlockHeader },
    NewBlock { block: Block },

    // Block sync
    BlockRangeRequest { start_height: u64, max_count: u64 },
    BlockRangeResponse { blocks: Vec<Block> },

    // Fork resolution
    ChainPieceRequest { hashes: Vec<Hash>, max_count: u64 },
    ChainPieceResponse { top_header: BlockHeader, found_ancestor: bool, blocks: Vec<Block> },
    ChainSliceRequest { begin: u64, end: u64 },
    ChainSliceResponse { blocks: Vec<Block> },

    // Group sync
    GroupHeightAnnounce { height: u64 },
    GroupRangeRequest { start_height: u64, max_count: u64 },
    GroupRangeResponse { groups: Vec<Group> },

    // Transaction gossip
    TxAnnounce { hashes: Vec<Hash> },
    TxRequest { hashes: Vec<Hash> },
    TxResponse { txs: Vec<Transaction> },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::TopBlockAnnounce { .. } => "top_announce",
            Message::NewBlock { .. } => "new_block",
            Message::BlockRangeRequest { .. } => "range_request",
            Message::BlockRangeResponse { .. } => "range_response",
            Message::ChainPieceRequest { .. } => "piece_request",
            Message::ChainPieceResponse { .. } => "piece_response",
            Message::ChainSliceRequest { .. } => "slice_request",
            Message::ChainSliceResponse { .. } => "slice_response",
            Message::GroupHeightAnnounce { .. } => "group_announce",
            Message::GroupRangeRequest { .. } => "group_request",
            Message::GroupRangeResponse { .. } => "group_response",
            Message::TxAnnounce { .. } => "tx_announce",
            Message::TxRequest { .. } => "tx_request",
            Message::TxResponse { .. } => "tx_response",
        }
    }
}
