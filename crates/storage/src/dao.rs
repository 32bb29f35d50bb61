// storage/src/dao.rs

use crate::StorageResult;
use async_trait::async_trait;
use chain_core::{
    Amount, Block, BlockNumber, Certification, Identity, InlineIdentity, Link, Membership,
    Timestamp, Transaction, TxSource,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wot_crypto::{Hash, Pubkey};

/// Persisted entry of the cores index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRecord {
    pub number: BlockNumber,
    pub hash: Hash,
    pub previous_hash: Hash,
}

/// Pending certification waiting for its target to be written
///
/// The target is tracked by identity digest because it may not be a member
/// yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCert {
    pub cert: Certification,
    pub target_digest: String,
}

/// Known peer record, carried through fork promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub pubkey: Pubkey,
    pub endpoint: String,
}

/// One per-counter statistic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Blocks that contributed to the counter
    pub blocks: Vec<BlockNumber>,
    /// Highest block already scanned, None before the first pass
    pub last_parsed_block: Option<BlockNumber>,
}

/// Stored record of a chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_hash: Hash,
    pub block_number: BlockNumber,
    pub issuers: Vec<Pubkey>,
    pub amount: Amount,
    pub comment: String,
    pub written_time: Timestamp,
}

/// Side effects of accepting one block, applied atomically
///
/// Built by the chain context; the DAL either commits all of it or none.
#[derive(Debug, Clone, Default)]
pub struct BlockDelta {
    pub new_identities: Vec<Identity>,
    /// `(pubkey, msn, membership time)` of members joining
    pub joiners: Vec<(Pubkey, u64, Timestamp)>,
    /// Membership renewals of existing members
    pub actives: Vec<(Pubkey, u64, Timestamp)>,
    /// Members that published an OUT membership
    pub leavers: Vec<(Pubkey, u64, Timestamp)>,
    /// Members excluded by this block
    pub excluded: Vec<Pubkey>,
    pub new_links: Vec<Link>,
    pub consumed_sources: Vec<TxSource>,
    pub new_sources: Vec<(TxSource, Amount)>,
}

/// The data-access contract consumed by the consensus core
///
/// Every operation is async and returns structured errors; a forked view
/// answers reads against its own overlay.
#[async_trait]
pub trait BlockchainDao: Send + Sync {
    // ---- chain reads ----

    /// Tip of this view, None on an empty chain
    async fn current(&self) -> StorageResult<Option<Block>>;

    async fn block(&self, number: BlockNumber) -> StorageResult<Block>;

    async fn block_opt(&self, number: BlockNumber) -> StorageResult<Option<Block>>;

    /// Confirmed block at the given height (alias kept for the public API)
    async fn promoted(&self, number: BlockNumber) -> StorageResult<Block>;

    /// Latest block that carried a universal dividend
    async fn last_ud_block(&self) -> StorageResult<Option<Block>>;

    // ---- chain writes ----

    /// Append a block and commit its side effects in one transaction
    async fn apply_block(&self, block: &Block, delta: &BlockDelta) -> StorageResult<()>;

    // ---- identities & membership ----

    async fn identity_by_pubkey(&self, pubkey: &Pubkey) -> StorageResult<Option<Identity>>;

    async fn identity_by_uid(&self, uid: &str) -> StorageResult<Option<Identity>>;

    async fn identity_by_digest(&self, digest: &str) -> StorageResult<Option<Identity>>;

    async fn members(&self) -> StorageResult<Vec<Identity>>;

    async fn is_member(&self, pubkey: &Pubkey) -> StorageResult<bool>;

    async fn require_member(&self, pubkey: &Pubkey) -> StorageResult<Identity>;

    async fn require_member_non_leaver(&self, pubkey: &Pubkey) -> StorageResult<Identity>;

    /// Members whose latest membership is older than `min_ms_time` or whose
    /// live incoming links fell below `sig_qty`
    async fn to_be_kicked(
        &self,
        min_ms_time: Timestamp,
        sig_qty: u64,
        min_link_time: Timestamp,
    ) -> StorageResult<Vec<Identity>>;

    // ---- links ----

    /// Links issued by `pubkey` no older than `min_time`
    async fn valid_links_from(
        &self,
        pubkey: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<Vec<Link>>;

    /// Links received by `pubkey` no older than `min_time`
    async fn valid_links_to(
        &self,
        pubkey: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<Vec<Link>>;

    /// Replay detection: a link from->to written at or after `min_time`
    async fn link_exists_from_after(
        &self,
        from: &Pubkey,
        to: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<bool>;

    // ---- transaction sources ----

    /// Unspent amount of a source, None when unknown or consumed
    async fn source_amount(&self, source: &TxSource) -> StorageResult<Option<Amount>>;

    // ---- cores index ----

    async fn cores(&self) -> StorageResult<Vec<CoreRecord>>;

    async fn add_core(&self, record: &CoreRecord) -> StorageResult<()>;

    async fn remove_core(&self, record: &CoreRecord) -> StorageResult<()>;

    // ---- pending pools ----

    async fn pending_identities(&self) -> StorageResult<Vec<InlineIdentity>>;

    async fn pending_identity_by_digest(
        &self,
        digest: &str,
    ) -> StorageResult<Option<InlineIdentity>>;

    async fn save_pending_identity(&self, identity: &InlineIdentity) -> StorageResult<()>;

    async fn pending_memberships(&self) -> StorageResult<Vec<Membership>>;

    async fn memberships_for_issuer(&self, issuer: &Pubkey) -> StorageResult<Vec<Membership>>;

    async fn save_pending_membership(&self, membership: &Membership) -> StorageResult<()>;

    /// Pending IN memberships, the newcomer candidates
    async fn find_newcomers(&self) -> StorageResult<Vec<Membership>>;

    /// Pending OUT memberships
    async fn find_leavers(&self) -> StorageResult<Vec<Membership>>;

    /// Pending certifications aimed at the identity with this digest
    async fn certs_to_target(&self, digest: &str) -> StorageResult<Vec<PendingCert>>;

    /// Pending certifications whose target already is a member
    async fn certs_for_members(&self) -> StorageResult<Vec<PendingCert>>;

    async fn save_pending_cert(&self, cert: &PendingCert) -> StorageResult<()>;

    async fn remove_pending_cert(&self, cert: &PendingCert) -> StorageResult<()>;

    async fn pending_transactions(&self) -> StorageResult<Vec<Transaction>>;

    async fn save_pending_transaction(&self, tx: &Transaction) -> StorageResult<()>;

    async fn remove_pending_tx(&self, hash: &Hash) -> StorageResult<()>;

    async fn peers(&self) -> StorageResult<Vec<Peer>>;

    async fn save_peer(&self, peer: &Peer) -> StorageResult<()>;

    // ---- stats & tx records ----

    async fn stat(&self, name: &str) -> StorageResult<Option<Stat>>;

    async fn save_stat(&self, name: &str, stat: &Stat) -> StorageResult<()>;

    async fn tx_records(&self) -> StorageResult<Vec<TxRecord>>;

    async fn save_tx_record(&self, record: &TxRecord) -> StorageResult<()>;

    async fn drop_tx_records(&self) -> StorageResult<()>;

    /// Write the tx records to their on-disk files, when a directory is set
    async fn flush_tx_records(&self) -> StorageResult<usize>;

    // ---- fork views ----

    /// A new view layered over this one, owning its own chain overlay
    async fn fork(&self) -> StorageResult<Arc<dyn BlockchainDao>>;

    /// Record the confirmed block this overlay is now anchored on
    async fn set_root(&self, number: BlockNumber, hash: Hash) -> StorageResult<()>;
}
