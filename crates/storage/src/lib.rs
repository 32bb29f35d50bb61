// storage/src/lib.rs

//! Data-access layer of the WoT currency node
//!
//! This crate provides:
//! - The `BlockchainDao` contract consumed by the consensus core
//! - `MemoryDal`, an in-memory implementation with copy-on-fork views
//! - Pending document pools, the cores index, per-counter stats and
//!   transaction records

pub mod dao;
pub mod memory;

pub use dao::{
    BlockDelta, BlockchainDao, CoreRecord, Peer, PendingCert, Stat, TxRecord,
};
pub use memory::MemoryDal;

use chain_core::BlockNumber;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(BlockNumber),

    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    #[error("{0} is not a member")]
    NotMember(String),

    #[error("{0} is on his way out")]
    Leaver(String),

    #[error("Non-contiguous block: expected {expected}, got {got}")]
    NonContiguousBlock { expected: BlockNumber, got: BlockNumber },

    #[error("Core not found: {0}-{1}")]
    CoreNotFound(BlockNumber, String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test
    }
}
