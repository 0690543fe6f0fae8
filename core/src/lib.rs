//! Tessera full-node core: chain admission and storage, block sync, fork
//! resolution, group sync and transaction gossip.

pub mod blockchain;
pub mod common;
pub mod config;
pub mod crypto;
pub mod groups;
pub mod mempool;
pub mod node;
pub mod p2p;
pub mod state;
pub mod storage;
pub mod tx;

#[cfg(feature = "dev-tools")]
pub mod testkit;

pub use config::NodeConfig;
pub use node::Node;
