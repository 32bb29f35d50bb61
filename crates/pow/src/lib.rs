// pow/src/lib.rs

//! Proof-of-work coordination
//!
//! This crate provides:
//! - A miner worker running on its own OS thread, driven by messages
//! - `PowCoordinator`, the single-miner state machine with cooperative
//!   cancellation and worker memory recycling

pub mod coordinator;
pub mod worker;

pub use coordinator::{PowCoordinator, PowStats, ProverState};
pub use worker::{ProofRequest, Worker, WorkerEvent, RELEASE_MEMORY_THRESHOLD};

/// Result type for proof operations
pub type PowResult<T> = Result<T, PowError>;

/// Errors that can occur while proving
#[derive(Debug, thiserror::Error)]
pub enum PowError {
    #[error("Invalid key material: {0}")]
    InvalidKey(#[from] wot_crypto::CryptoError),

    #[error("Proof worker died unexpectedly")]
    WorkerDied,

    #[error("A proof is already in progress")]
    AlreadyProving,
}
