// chain-core/src/types.rs

/// Block height
pub type BlockNumber = u64;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Monetary amount in base units
pub type Amount = u64;

/// Membership sequence number; -1 before any membership was recorded
pub type Msn = i64;
