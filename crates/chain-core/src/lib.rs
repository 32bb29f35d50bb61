// chain-core/src/lib.rs

//! Core data model of the WoT currency chain
//!
//! This crate provides:
//! - Protocol parameters (the height-0 constants)
//! - Block structure with its raw wire form
//! - Identities, memberships, certifications and links
//! - Transaction documents

pub mod block;
pub mod identity;
pub mod params;
pub mod tx;
pub mod types;

pub use block::{Block, BLOCK_VERSION};
pub use identity::{
    Certification, Identity, InlineIdentity, Link, Membership, MembershipKind,
};
pub use params::ProtocolParameters;
pub use tx::{Transaction, TxInput, TxOutput, TxSource};
pub use types::*;

/// Result type for data-model operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors that can occur while building or parsing chain documents
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    #[error("Cryptographic error: {0}")]
    CryptoError(#[from] wot_crypto::CryptoError),
}

/// Current wall-clock time as a unix timestamp
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}
