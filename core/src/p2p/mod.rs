//! Peer-to-peer layer: peer scoring, block sync, fork resolution, group
//! sync and transaction gossip, plus the framing and TCP transport that
//! carry them.
//!
//! Protocol handlers are synchronous. They are driven by the [`Router`]
//! for inbound messages and by the ticker for periodic and timeout
//! routines, and they talk to the outside only through [`Transport`].

pub mod candidates;
pub mod codec;
pub mod fork;
pub mod fork_session;
pub mod group_sync;
pub mod messages;
pub mod net;
pub mod peers;
pub mod router;
pub mod sync;
pub mod tx_sync;

use thiserror::Error;

use crate::blockchain::AdmissionError;
use crate::crypto::Hash;

pub use candidates::{CandidatePool, CandidateTop};
pub use fork::ForkProcessor;
pub use group_sync::GroupSyncer;
pub use messages::Message;
pub use peers::PeerManager;
pub use router::Router;
pub use sync::BlockSyncer;
pub use tx_sync::TxSyncer;

/// Peer identity as exchanged in the handshake.
pub type PeerId = String;

/// Outbound side of the network. Sends never block on I/O.
pub trait Transport: Send + Sync {
    fn send(&self, peer: &PeerId, msg: Message);
    fn transmit_to_neighbors(&self, msg: Message);
}

/// Inbound side: the transport hands every decoded message to one handler.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, source: PeerId, msg: Message);
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("block range start={start} count={count} invalid at local height {local}")]
    InvalidRange { start: u64, count: u64, local: u64 },
    #[error("chain slice [{begin}, {end}) invalid at local height {local}")]
    InvalidSlice { begin: u64, end: u64, local: u64 },
    #[error("{count} transaction hashes, at most {max} per message")]
    TooManyHashes { count: usize, max: usize },
    #[error("empty chain piece")]
    EmptyPiece,
    #[error("header {0} does not match its hash")]
    BadHeader(Hash),
    #[error("peer {0} is banned")]
    Banned(PeerId),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}
