// consensus/src/lib.rs

//! Consensus core of the WoT currency node
//!
//! This crate implements:
//! - Local (structural) and global (contextual) block validation
//! - Web-of-Trust reachability: sentries, distance, stability checks
//! - `ChainContext`, binding the validators to one DAL view
//! - `ForkManager`, the bounded fork window with promotion pruning
//! - `BlockAssembler`, candidate block generation

pub mod assembler;
pub mod context;
pub mod fork;
pub mod global;
pub mod local;
pub mod wot;

pub use assembler::{
    BlockAssembler, GenerationPolicy, IdentityRequirements, ManualRootPolicy, NextBlockPolicy,
    PreJoin,
};
pub use context::ChainContext;
pub use fork::{Core, ForkManager, SubmitOutcome};
pub use global::GlobalValidator;
pub use wot::WotGraph;

use chain_core::{BlockNumber, Timestamp};
use wot_crypto::Pubkey;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors that can occur while validating or assembling blocks
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Previous block not found")]
    PreviousNotFound,

    #[error("Block already known")]
    AlreadyKnown,

    #[error("Wrong signature for block")]
    BadSignature,

    #[error("Insufficient proof-of-work: required {required} zeros, got {got}")]
    BadPoW { required: u32, got: u32 },

    #[error("{pubkey} is outdistanced from {failing} sentries")]
    Outdistanced { pubkey: Pubkey, failing: usize },

    #[error("Replayed certification from {from} to {to}")]
    ReplayedCert { from: Pubkey, to: Pubkey },

    #[error("Expired certification from {from} to {to}")]
    StaleCert { from: Pubkey, to: Pubkey },

    #[error("Certification basis block {0} does not exist")]
    UnknownBasisBlock(BlockNumber),

    #[error("Certifier {0} is not a member")]
    CertifierNotMember(Pubkey),

    #[error("Certified {0} is neither a member nor a newcomer")]
    CertifiedNotMember(Pubkey),

    #[error("{pubkey} has {got} certifications, {required} required")]
    NotEnoughCertifications {
        pubkey: Pubkey,
        got: u64,
        required: u64,
    },

    #[error("UID `{0}` already taken")]
    UidTaken(String),

    #[error("Pubkey {0} already taken")]
    PubkeyTaken(Pubkey),

    #[error("More than one membership for {0} in block")]
    DoubleMembership(Pubkey),

    #[error("Membership of {0} is expired")]
    StaleMembership(Pubkey),

    #[error("Membership sequence number of {0} must increase")]
    WrongMsn(Pubkey),

    #[error("{0} is already a member")]
    AlreadyMember(Pubkey),

    #[error("{0} is not a member")]
    MembershipNonMember(Pubkey),

    #[error("Wrong median time: expected {expected}, got {got}")]
    BadMedianTime { expected: Timestamp, got: Timestamp },

    #[error("Wrong PoWMin: expected {expected}, got {got}")]
    BadPowMin { expected: u32, got: u32 },

    #[error("Wrong dividend: expected {expected:?}, got {got:?}")]
    BadDividend {
        expected: Option<u64>,
        got: Option<u64>,
    },

    #[error("Wrong members count: expected {expected}, got {got}")]
    BadMembersCount { expected: u64, got: u64 },

    #[error("Wrong previous issuer")]
    BadPreviousIssuer,

    #[error("Invalid root block: {0}")]
    BadRootBlock(String),

    #[error("Invalid block structure: {0}")]
    BadStructure(String),

    #[error("Source {0} is unknown or already consumed")]
    UnavailableSource(String),

    #[error("Document error: {0}")]
    DocumentError(#[from] chain_core::ChainError),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("Cryptographic error: {0}")]
    CryptoError(#[from] wot_crypto::CryptoError),
}

impl ConsensusError {
    /// Stable code surfaced to API callers
    pub fn code(&self) -> &'static str {
        match self {
            ConsensusError::PreviousNotFound => "PREVIOUS_NOT_FOUND",
            ConsensusError::AlreadyKnown => "ALREADY_KNOWN",
            ConsensusError::BadSignature => "BAD_SIGNATURE",
            ConsensusError::BadPoW { .. } => "BAD_POW",
            ConsensusError::Outdistanced { .. } => "OUTDISTANCED",
            ConsensusError::ReplayedCert { .. } => "REPLAYED_CERT",
            ConsensusError::StaleCert { .. } => "STALE_CERT",
            ConsensusError::UnknownBasisBlock(_) => "UNKNOWN_BASIS_BLOCK",
            ConsensusError::CertifierNotMember(_) => "CERTIFIER_NOT_MEMBER",
            ConsensusError::CertifiedNotMember(_) => "CERTIFIED_NOT_MEMBER",
            ConsensusError::NotEnoughCertifications { .. } => "NOT_ENOUGH_CERTIFICATIONS",
            ConsensusError::UidTaken(_) => "UID_TAKEN",
            ConsensusError::PubkeyTaken(_) => "PUBKEY_TAKEN",
            ConsensusError::DoubleMembership(_) => "DOUBLE_MEMBERSHIP",
            ConsensusError::StaleMembership(_) => "STALE_MEMBERSHIP",
            ConsensusError::WrongMsn(_) => "WRONG_MSN",
            ConsensusError::AlreadyMember(_) => "ALREADY_MEMBER",
            ConsensusError::MembershipNonMember(_) => "NOT_A_MEMBER",
            ConsensusError::BadMedianTime { .. } => "BAD_MEDIAN_TIME",
            ConsensusError::BadPowMin { .. } => "BAD_POW_MIN",
            ConsensusError::BadDividend { .. } => "BAD_DIVIDEND",
            ConsensusError::BadMembersCount { .. } => "BAD_MEMBERS_COUNT",
            ConsensusError::BadPreviousIssuer => "BAD_PREVIOUS_ISSUER",
            ConsensusError::BadRootBlock(_) => "BAD_ROOT_BLOCK",
            ConsensusError::BadStructure(_) => "BAD_STRUCTURE",
            ConsensusError::UnavailableSource(_) => "UNAVAILABLE_SOURCE",
            ConsensusError::DocumentError(_) => "BAD_DOCUMENT",
            ConsensusError::StorageError(_) => "STORAGE_ERROR",
            ConsensusError::CryptoError(_) => "CRYPTO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test
    }
}
