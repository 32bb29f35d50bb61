// chain-core/src/identity.rs

use crate::{BlockNumber, ChainError, ChainResult, Msn, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use wot_crypto::{sha1_hex_upper, Pubkey, Signature};

/// Identity entry as carried inline in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineIdentity {
    pub pubkey: Pubkey,
    pub signature: Signature,
    pub time: Timestamp,
    pub uid: String,
}

impl InlineIdentity {
    /// Lookup digest: uppercase SHA-1 of `uid|time|pubkey`
    pub fn digest(&self) -> String {
        sha1_hex_upper(&self.message())
    }

    /// The self-certification payload covered by `signature`
    pub fn message(&self) -> String {
        format!("{}|{}|{}", self.uid, self.time, self.pubkey)
    }

    pub fn to_inline(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.pubkey, self.signature, self.time, self.uid
        )
    }

    pub fn from_inline(s: &str) -> ChainResult<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(ChainError::MalformedDocument(format!(
                "inline identity `{s}`"
            )));
        }
        Ok(Self {
            pubkey: fields[0].parse()?,
            signature: fields[1].parse()?,
            time: fields[2]
                .parse()
                .map_err(|_| ChainError::MalformedDocument(format!("identity time `{s}`")))?,
            uid: fields[3].to_string(),
        })
    }
}

/// Identity with its accumulated chain state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub pubkey: Pubkey,
    pub uid: String,
    pub time: Timestamp,
    pub signature: Signature,
    /// Currently a member
    pub member: bool,
    /// Has been a member at some point
    pub was_member: bool,
    /// Published an OUT membership that is still in effect
    pub leaving: bool,
    /// Highest membership sequence number seen, -1 before the first one
    pub current_msn: Msn,
    /// Time of the latest membership renewal, 0 before the first one
    pub last_ms_time: Timestamp,
}

impl Identity {
    pub fn from_inline(inline: &InlineIdentity) -> Self {
        Self {
            pubkey: inline.pubkey,
            uid: inline.uid.clone(),
            time: inline.time,
            signature: inline.signature,
            member: false,
            was_member: false,
            leaving: false,
            current_msn: -1,
            last_ms_time: 0,
        }
    }

    pub fn digest(&self) -> String {
        sha1_hex_upper(&format!("{}|{}|{}", self.uid, self.time, self.pubkey))
    }

    pub fn as_inline(&self) -> InlineIdentity {
        InlineIdentity {
            pubkey: self.pubkey,
            signature: self.signature,
            time: self.time,
            uid: self.uid.clone(),
        }
    }
}

/// Membership direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipKind {
    In,
    Out,
}

impl fmt::Display for MembershipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipKind::In => write!(f, "IN"),
            MembershipKind::Out => write!(f, "OUT"),
        }
    }
}

/// Membership document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub issuer: Pubkey,
    pub signature: Signature,
    /// Membership sequence number
    pub number: u64,
    /// Timestamp of the identity self-certification this refers to
    pub certts: Timestamp,
    pub userid: String,
    pub membership: MembershipKind,
}

impl Membership {
    /// The payload covered by `signature`
    pub fn message(&self) -> String {
        format!(
            "Membership:{}:{}:{}:{}:{}",
            self.issuer, self.membership, self.number, self.certts, self.userid
        )
    }

    /// Inline form; the direction is implied by the block section
    pub fn to_inline(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.issuer, self.signature, self.number, self.certts, self.userid
        )
    }

    pub fn from_inline(s: &str, membership: MembershipKind) -> ChainResult<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 5 {
            return Err(ChainError::MalformedDocument(format!(
                "inline membership `{s}`"
            )));
        }
        let bad = || ChainError::MalformedDocument(format!("inline membership `{s}`"));
        Ok(Self {
            issuer: fields[0].parse()?,
            signature: fields[1].parse()?,
            number: fields[2].parse().map_err(|_| bad())?,
            certts: fields[3].parse().map_err(|_| bad())?,
            userid: fields[4].to_string(),
            membership,
        })
    }
}

/// Certification document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certification {
    pub from: Pubkey,
    pub to: Pubkey,
    /// Number of the block the certification was based on
    pub basis: BlockNumber,
    pub signature: Signature,
}

impl Certification {
    /// The payload covered by `signature`
    pub fn message(&self) -> String {
        format!("Certification:{}:{}:{}", self.from, self.to, self.basis)
    }

    pub fn to_inline(&self) -> String {
        format!("{}:{}:{}:{}", self.from, self.to, self.basis, self.signature)
    }

    pub fn from_inline(s: &str) -> ChainResult<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(ChainError::MalformedDocument(format!(
                "inline certification `{s}`"
            )));
        }
        Ok(Self {
            from: fields[0].parse()?,
            to: fields[1].parse()?,
            basis: fields[2].parse().map_err(|_| {
                ChainError::MalformedDocument(format!("inline certification `{s}`"))
            })?,
            signature: fields[3].parse()?,
        })
    }
}

/// Materialized certification edge between two members
///
/// Written when a block carrying the certification is accepted; its
/// timestamp is that block's median time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub from: Pubkey,
    pub to: Pubkey,
    pub timestamp: Timestamp,
}
