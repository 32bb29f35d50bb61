// storage/src/memory.rs

use crate::{
    dao::{BlockDelta, BlockchainDao, CoreRecord, Peer, PendingCert, Stat, TxRecord},
    StorageError, StorageResult,
};
use async_trait::async_trait;
use chain_core::{
    Amount, Block, BlockNumber, Identity, InlineIdentity, Link, Membership, MembershipKind,
    Timestamp, Transaction, TxSource,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use wot_crypto::{Hash, Pubkey};

/// Chain-side state of one view; cloned wholesale on `fork()`
#[derive(Debug, Clone, Default)]
struct ChainState {
    blocks: Vec<Block>,
    identities: HashMap<Pubkey, Identity>,
    by_uid: HashMap<String, Pubkey>,
    by_digest: HashMap<String, Pubkey>,
    links: Vec<Link>,
    sources: HashMap<TxSource, Amount>,
    consumed: HashSet<TxSource>,
    cores: Vec<CoreRecord>,
    stats: HashMap<String, Stat>,
    tx_records: Vec<TxRecord>,
    root_anchor: Option<(BlockNumber, Hash)>,
}

/// Node-local documents; shared between a view and its forks
#[derive(Debug, Default)]
struct PendingState {
    identities: Vec<InlineIdentity>,
    memberships: Vec<Membership>,
    certs: Vec<PendingCert>,
    transactions: Vec<Transaction>,
    peers: Vec<Peer>,
}

/// In-memory DAL
///
/// `fork()` snapshots the chain state into a fresh view; pending pools are
/// node-local and shared with the forks. A persistent backend would overlay
/// files instead, behind the same contract.
pub struct MemoryDal {
    chain: RwLock<ChainState>,
    pending: Arc<RwLock<PendingState>>,
    files_dir: Option<PathBuf>,
}

impl MemoryDal {
    pub fn new() -> Self {
        Self {
            chain: RwLock::new(ChainState::default()),
            pending: Arc::new(RwLock::new(PendingState::default())),
            files_dir: None,
        }
    }

    /// A DAL that can flush tx records under the given directory
    pub fn with_files_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: Some(dir.into()),
            ..Self::new()
        }
    }
}

impl Default for MemoryDal {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainState {
    fn insert_identity(&mut self, identity: Identity) {
        self.by_uid.insert(identity.uid.clone(), identity.pubkey);
        self.by_digest.insert(identity.digest(), identity.pubkey);
        self.identities.insert(identity.pubkey, identity);
    }
}

#[async_trait]
impl BlockchainDao for MemoryDal {
    async fn current(&self) -> StorageResult<Option<Block>> {
        Ok(self.chain.read().await.blocks.last().cloned())
    }

    async fn block(&self, number: BlockNumber) -> StorageResult<Block> {
        self.block_opt(number)
            .await?
            .ok_or(StorageError::BlockNotFound(number))
    }

    async fn block_opt(&self, number: BlockNumber) -> StorageResult<Option<Block>> {
        Ok(self.chain.read().await.blocks.get(number as usize).cloned())
    }

    async fn promoted(&self, number: BlockNumber) -> StorageResult<Block> {
        self.block(number).await
    }

    async fn last_ud_block(&self) -> StorageResult<Option<Block>> {
        let chain = self.chain.read().await;
        Ok(chain
            .blocks
            .iter()
            .rev()
            .find(|b| b.dividend.is_some())
            .cloned())
    }

    async fn apply_block(&self, block: &Block, delta: &BlockDelta) -> StorageResult<()> {
        let mut chain = self.chain.write().await;
        let expected = chain.blocks.len() as BlockNumber;
        if block.number != expected {
            return Err(StorageError::NonContiguousBlock {
                expected,
                got: block.number,
            });
        }

        // All checks done; past this point every mutation commits.
        for identity in &delta.new_identities {
            chain.insert_identity(identity.clone());
        }
        for (pubkey, msn, ms_time) in &delta.joiners {
            if let Some(identity) = chain.identities.get_mut(pubkey) {
                identity.member = true;
                identity.was_member = true;
                identity.leaving = false;
                identity.current_msn = *msn as i64;
                identity.last_ms_time = *ms_time;
            }
        }
        for (pubkey, msn, ms_time) in &delta.actives {
            if let Some(identity) = chain.identities.get_mut(pubkey) {
                identity.current_msn = *msn as i64;
                identity.last_ms_time = *ms_time;
            }
        }
        for (pubkey, msn, ms_time) in &delta.leavers {
            if let Some(identity) = chain.identities.get_mut(pubkey) {
                identity.leaving = true;
                identity.current_msn = *msn as i64;
                identity.last_ms_time = *ms_time;
            }
        }
        for pubkey in &delta.excluded {
            if let Some(identity) = chain.identities.get_mut(pubkey) {
                identity.member = false;
                identity.leaving = false;
            }
        }
        chain.links.extend(delta.new_links.iter().copied());
        for source in &delta.consumed_sources {
            chain.sources.remove(source);
            chain.consumed.insert(source.clone());
        }
        for (source, amount) in &delta.new_sources {
            chain.sources.insert(source.clone(), *amount);
        }
        chain.blocks.push(block.clone());
        tracing::debug!(
            number = block.number,
            hash = %block.hash(),
            "block applied to view"
        );
        Ok(())
    }

    async fn identity_by_pubkey(&self, pubkey: &Pubkey) -> StorageResult<Option<Identity>> {
        Ok(self.chain.read().await.identities.get(pubkey).cloned())
    }

    async fn identity_by_uid(&self, uid: &str) -> StorageResult<Option<Identity>> {
        let chain = self.chain.read().await;
        Ok(chain
            .by_uid
            .get(uid)
            .and_then(|p| chain.identities.get(p))
            .cloned())
    }

    async fn identity_by_digest(&self, digest: &str) -> StorageResult<Option<Identity>> {
        let chain = self.chain.read().await;
        Ok(chain
            .by_digest
            .get(digest)
            .and_then(|p| chain.identities.get(p))
            .cloned())
    }

    async fn members(&self) -> StorageResult<Vec<Identity>> {
        let chain = self.chain.read().await;
        Ok(chain
            .identities
            .values()
            .filter(|i| i.member)
            .cloned()
            .collect())
    }

    async fn is_member(&self, pubkey: &Pubkey) -> StorageResult<bool> {
        Ok(self
            .chain
            .read()
            .await
            .identities
            .get(pubkey)
            .map(|i| i.member)
            .unwrap_or(false))
    }

    async fn require_member(&self, pubkey: &Pubkey) -> StorageResult<Identity> {
        let identity = self
            .identity_by_pubkey(pubkey)
            .await?
            .ok_or_else(|| StorageError::IdentityNotFound(pubkey.to_string()))?;
        if !identity.member {
            return Err(StorageError::NotMember(pubkey.to_string()));
        }
        Ok(identity)
    }

    async fn require_member_non_leaver(&self, pubkey: &Pubkey) -> StorageResult<Identity> {
        let identity = self.require_member(pubkey).await?;
        if identity.leaving {
            return Err(StorageError::Leaver(pubkey.to_string()));
        }
        Ok(identity)
    }

    async fn to_be_kicked(
        &self,
        min_ms_time: Timestamp,
        sig_qty: u64,
        min_link_time: Timestamp,
    ) -> StorageResult<Vec<Identity>> {
        let chain = self.chain.read().await;
        let mut kicked = Vec::new();
        for identity in chain.identities.values().filter(|i| i.member) {
            let stale_membership = identity.last_ms_time < min_ms_time;
            let live_links = chain
                .links
                .iter()
                .filter(|l| l.to == identity.pubkey && l.timestamp >= min_link_time)
                .count() as u64;
            if stale_membership || live_links < sig_qty {
                kicked.push(identity.clone());
            }
        }
        kicked.sort_by_key(|i| i.uid.clone());
        Ok(kicked)
    }

    async fn valid_links_from(
        &self,
        pubkey: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<Vec<Link>> {
        let chain = self.chain.read().await;
        Ok(chain
            .links
            .iter()
            .filter(|l| l.from == *pubkey && l.timestamp >= min_time)
            .copied()
            .collect())
    }

    async fn valid_links_to(
        &self,
        pubkey: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<Vec<Link>> {
        let chain = self.chain.read().await;
        Ok(chain
            .links
            .iter()
            .filter(|l| l.to == *pubkey && l.timestamp >= min_time)
            .copied()
            .collect())
    }

    async fn link_exists_from_after(
        &self,
        from: &Pubkey,
        to: &Pubkey,
        min_time: Timestamp,
    ) -> StorageResult<bool> {
        let chain = self.chain.read().await;
        Ok(chain
            .links
            .iter()
            .any(|l| l.from == *from && l.to == *to && l.timestamp >= min_time))
    }

    async fn source_amount(&self, source: &TxSource) -> StorageResult<Option<Amount>> {
        Ok(self.chain.read().await.sources.get(source).copied())
    }

    async fn cores(&self) -> StorageResult<Vec<CoreRecord>> {
        Ok(self.chain.read().await.cores.clone())
    }

    async fn add_core(&self, record: &CoreRecord) -> StorageResult<()> {
        let mut chain = self.chain.write().await;
        if !chain.cores.contains(record) {
            chain.cores.push(record.clone());
        }
        Ok(())
    }

    async fn remove_core(&self, record: &CoreRecord) -> StorageResult<()> {
        let mut chain = self.chain.write().await;
        let before = chain.cores.len();
        chain.cores.retain(|c| c != record);
        if chain.cores.len() == before {
            return Err(StorageError::CoreNotFound(
                record.number,
                record.hash.to_hex(),
            ));
        }
        Ok(())
    }

    async fn pending_identities(&self) -> StorageResult<Vec<InlineIdentity>> {
        Ok(self.pending.read().await.identities.clone())
    }

    async fn pending_identity_by_digest(
        &self,
        digest: &str,
    ) -> StorageResult<Option<InlineIdentity>> {
        Ok(self
            .pending
            .read()
            .await
            .identities
            .iter()
            .find(|i| i.digest() == digest)
            .cloned())
    }

    async fn save_pending_identity(&self, identity: &InlineIdentity) -> StorageResult<()> {
        let mut pending = self.pending.write().await;
        if !pending.identities.iter().any(|i| i.digest() == identity.digest()) {
            pending.identities.push(identity.clone());
        }
        Ok(())
    }

    async fn pending_memberships(&self) -> StorageResult<Vec<Membership>> {
        Ok(self.pending.read().await.memberships.clone())
    }

    async fn memberships_for_issuer(&self, issuer: &Pubkey) -> StorageResult<Vec<Membership>> {
        Ok(self
            .pending
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.issuer == *issuer)
            .cloned()
            .collect())
    }

    async fn save_pending_membership(&self, membership: &Membership) -> StorageResult<()> {
        let mut pending = self.pending.write().await;
        // One entry per issuer and sequence number
        pending
            .memberships
            .retain(|m| !(m.issuer == membership.issuer && m.number == membership.number));
        pending.memberships.push(membership.clone());
        Ok(())
    }

    async fn find_newcomers(&self) -> StorageResult<Vec<Membership>> {
        Ok(self
            .pending
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.membership == MembershipKind::In)
            .cloned()
            .collect())
    }

    async fn find_leavers(&self) -> StorageResult<Vec<Membership>> {
        Ok(self
            .pending
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.membership == MembershipKind::Out)
            .cloned()
            .collect())
    }

    async fn certs_to_target(&self, digest: &str) -> StorageResult<Vec<PendingCert>> {
        Ok(self
            .pending
            .read()
            .await
            .certs
            .iter()
            .filter(|c| c.target_digest == digest)
            .cloned()
            .collect())
    }

    async fn certs_for_members(&self) -> StorageResult<Vec<PendingCert>> {
        let certs = self.pending.read().await.certs.clone();
        let chain = self.chain.read().await;
        Ok(certs
            .into_iter()
            .filter(|c| {
                chain
                    .identities
                    .get(&c.cert.to)
                    .map(|i| i.member)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn save_pending_cert(&self, cert: &PendingCert) -> StorageResult<()> {
        let mut pending = self.pending.write().await;
        if !pending.certs.contains(cert) {
            pending.certs.push(cert.clone());
        }
        Ok(())
    }

    async fn remove_pending_cert(&self, cert: &PendingCert) -> StorageResult<()> {
        self.pending.write().await.certs.retain(|c| c != cert);
        Ok(())
    }

    async fn pending_transactions(&self) -> StorageResult<Vec<Transaction>> {
        Ok(self.pending.read().await.transactions.clone())
    }

    async fn save_pending_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        let mut pending = self.pending.write().await;
        let hash = tx.hash();
        if !pending.transactions.iter().any(|t| t.hash() == hash) {
            pending.transactions.push(tx.clone());
        }
        Ok(())
    }

    async fn remove_pending_tx(&self, hash: &Hash) -> StorageResult<()> {
        self.pending
            .write()
            .await
            .transactions
            .retain(|t| t.hash() != *hash);
        Ok(())
    }

    async fn peers(&self) -> StorageResult<Vec<Peer>> {
        Ok(self.pending.read().await.peers.clone())
    }

    async fn save_peer(&self, peer: &Peer) -> StorageResult<()> {
        let mut pending = self.pending.write().await;
        pending.peers.retain(|p| p.pubkey != peer.pubkey);
        pending.peers.push(peer.clone());
        Ok(())
    }

    async fn stat(&self, name: &str) -> StorageResult<Option<Stat>> {
        Ok(self.chain.read().await.stats.get(name).cloned())
    }

    async fn save_stat(&self, name: &str, stat: &Stat) -> StorageResult<()> {
        self.chain
            .write()
            .await
            .stats
            .insert(name.to_string(), stat.clone());
        Ok(())
    }

    async fn tx_records(&self) -> StorageResult<Vec<TxRecord>> {
        Ok(self.chain.read().await.tx_records.clone())
    }

    async fn save_tx_record(&self, record: &TxRecord) -> StorageResult<()> {
        self.chain.write().await.tx_records.push(record.clone());
        Ok(())
    }

    async fn drop_tx_records(&self) -> StorageResult<()> {
        self.chain.write().await.tx_records.clear();
        Ok(())
    }

    async fn flush_tx_records(&self) -> StorageResult<usize> {
        let records = self.chain.read().await.tx_records.clone();
        if let Some(dir) = &self.files_dir {
            let bytes = serde_json::to_vec_pretty(&records)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(dir.join("tx_records.json"), bytes).await?;
        }
        Ok(records.len())
    }

    async fn fork(&self) -> StorageResult<Arc<dyn BlockchainDao>> {
        let chain = self.chain.read().await.clone();
        Ok(Arc::new(MemoryDal {
            chain: RwLock::new(chain),
            pending: self.pending.clone(),
            files_dir: self.files_dir.clone(),
        }))
    }

    async fn set_root(&self, number: BlockNumber, hash: Hash) -> StorageResult<()> {
        let previous = self
            .chain
            .write()
            .await
            .root_anchor
            .replace((number, hash));
        tracing::debug!(number, hash = %hash, ?previous, "view re-anchored");
        Ok(())
    }
}
