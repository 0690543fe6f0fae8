pub mod lmdb;

use thiserror::Error;

pub use crate::config::StoreConfig;
pub use lmdb::ChainStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("lmdb: {0}")]
    Heed(#[from] heed::Error),
    #[error("missing {what} for {key}")]
    Missing { what: &'static str, key: String },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
