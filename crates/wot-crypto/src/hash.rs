// wot-crypto/src/hash.rs

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash output size in bytes
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 hash value
///
/// Byte ordering is also the lexicographic ordering of the uppercase hex
/// form, which is what fork election compares.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create a new hash from bytes
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a hash from a slice (returns error if wrong length)
    pub fn from_slice(slice: &[u8]) -> Result<Self, crate::CryptoError> {
        if slice.len() != HASH_SIZE {
            return Err(crate::CryptoError::InvalidHash);
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Create a zero hash (previous hash of the root block)
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    /// Convert to uppercase hex, the on-wire form
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse from hex string (case-insensitive)
    pub fn from_hex(s: &str) -> Result<Self, crate::CryptoError> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::CryptoError::DeserializationError(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Number of leading zero nibbles, the proof-of-work measure
    pub fn leading_zero_nibbles(&self) -> u32 {
        let mut count = 0;
        for byte in self.0.iter() {
            if *byte == 0 {
                count += 2;
                continue;
            }
            if byte >> 4 == 0 {
                count += 1;
            }
            return count;
        }
        count
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hash({}...{})",
            hex::encode_upper(&self.0[..4]),
            hex::encode_upper(&self.0[28..])
        )
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Trait for types with a canonical SHA-256 digest
pub trait Hashable {
    fn hash(&self) -> Hash;
}

impl Hashable for [u8] {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self);
        Hash::new(hasher.finalize().into())
    }
}

impl Hashable for &str {
    fn hash(&self) -> Hash {
        self.as_bytes().hash()
    }
}

impl Hashable for String {
    fn hash(&self) -> Hash {
        self.as_bytes().hash()
    }
}

/// SHA-1 digest as uppercase hex, used for identity lookup keys
pub fn sha1_hex_upper(data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_basic() {
        let data = b"Currency: wotcoin";
        let hash1 = data.as_slice().hash();
        let hash2 = data.as_slice().hash();
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = "some raw block".hash();
        let hex = hash.to_hex();
        assert_eq!(hex, hex.to_uppercase());
        let parsed = Hash::from_hex(&hex).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_leading_zero_nibbles() {
        let mut bytes = [0xFFu8; HASH_SIZE];
        assert_eq!(Hash::new(bytes).leading_zero_nibbles(), 0);

        bytes[0] = 0x0F;
        assert_eq!(Hash::new(bytes).leading_zero_nibbles(), 1);

        bytes[0] = 0x00;
        bytes[1] = 0x01;
        assert_eq!(Hash::new(bytes).leading_zero_nibbles(), 3);

        assert_eq!(Hash::zero().leading_zero_nibbles(), 64);
    }

    #[test]
    fn test_byte_order_matches_hex_order() {
        let a = Hash::from_hex(&format!("0A{}", "00".repeat(31))).unwrap();
        let b = Hash::from_hex(&format!("0F{}", "00".repeat(31))).unwrap();
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn test_sha1_digest() {
        let digest = sha1_hex_upper("alice|1500000000|ABC");
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, digest.to_uppercase());
        assert_eq!(digest, sha1_hex_upper("alice|1500000000|ABC"));
    }
}
