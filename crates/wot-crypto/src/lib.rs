// wot-crypto/src/lib.rs

//! Cryptographic primitives for the WoT currency node
//!
//! This crate provides:
//! - Block hashing (SHA-256) and identity digests (SHA-1)
//! - Ed25519 key pairs with base58 transport encoding
//! - Detached signatures over raw document text

pub mod hash;
pub mod keys;
pub mod signature;

pub use hash::{sha1_hex_upper, Hash, Hashable};
pub use keys::{KeyPair, Pubkey, SecretKey, Signer};
pub use signature::Signature;

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid hash")]
    InvalidHash,

    #[error("Base58 decoding error: {0}")]
    Base58Error(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
