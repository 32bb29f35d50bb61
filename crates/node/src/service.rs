// node/src/service.rs

use crate::NodeConfig;
use chain_core::{Block, BlockNumber, Certification, InlineIdentity, Membership, Transaction};
use consensus::{
    BlockAssembler, ChainContext, ConsensusError, ForkManager, IdentityRequirements,
    ManualRootPolicy, NextBlockPolicy, SubmitOutcome,
};
use pow::{PowCoordinator, PowError, PowStats, ProofRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{BlockchainDao, MemoryDal, PendingCert, Stat, StorageError, TxRecord};
use tokio::sync::Mutex;
use wot_crypto::KeyPair;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the service facade
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Node has no signing key configured")]
    NoKeypair,

    #[error("Chain already initialized")]
    ChainAlreadyStarted,

    #[error("Generation requires participate = true and a signing key")]
    GenerationDisabled,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Pow(#[from] PowError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Document error: {0}")]
    Document(#[from] chain_core::ChainError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] wot_crypto::CryptoError),
}

/// The blockchain service: every public operation of the core
///
/// Submissions run one at a time behind the fork-manager lock; statistics
/// recomputation has its own queue; the proof coordinator serializes
/// mining.
pub struct BlockchainService {
    config: NodeConfig,
    forks: Arc<Mutex<ForkManager>>,
    pow: Arc<PowCoordinator>,
    keypair: Option<Arc<KeyPair>>,
    stat_queue: Arc<Mutex<()>>,
    stop_asked: Arc<AtomicBool>,
}

/// Counters tracked by the statistics pass
const STAT_NAMES: [&str; 8] = [
    "newcomers", "certs", "joiners", "actives", "leavers", "excluded", "ud", "tx",
];

impl BlockchainService {
    pub async fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let dal: Arc<dyn BlockchainDao> =
            Arc::new(MemoryDal::with_files_dir(format!("{}/txs", config.data_dir)));
        let context = ChainContext::new(dal, config.params.clone());
        let forks = ForkManager::new(context, config.branches_window_size).await?;
        let keypair = match &config.secret_key {
            Some(secret) => Some(Arc::new(KeyPair::from_base58_secret(secret)?)),
            None => None,
        };
        tracing::info!(
            currency = %config.currency,
            window = config.branches_window_size,
            participate = config.participate,
            "blockchain service initialized"
        );
        Ok(Self {
            config,
            forks: Arc::new(Mutex::new(forks)),
            pow: Arc::new(PowCoordinator::new()),
            keypair,
            stat_queue: Arc::new(Mutex::new(())),
            stop_asked: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn pubkey(&self) -> Option<wot_crypto::Pubkey> {
        self.keypair.as_ref().map(|kp| kp.pubkey())
    }

    fn require_keypair(&self) -> ServiceResult<Arc<KeyPair>> {
        self.keypair.clone().ok_or(ServiceError::NoKeypair)
    }

    /// The context reads go through: the main fork when one exists
    async fn working(&self) -> ChainContext {
        self.forks.lock().await.working_context().clone()
    }

    fn assembler(&self, context: ChainContext) -> BlockAssembler {
        BlockAssembler::new(context, self.config.currency.clone(), self.config.root_offset)
    }

    // ==================== SUBMISSION PIPELINE ====================

    /// Submit an externally received block: admit, prune, then cancel any
    /// proof racing against it
    pub async fn submit_block(&self, block: &Block, do_check: bool) -> ServiceResult<SubmitOutcome> {
        let outcome = self.admit(block, do_check).await?;
        // A better block arrived: whatever we were mining is stale
        let _ = self.pow.request_cancel();
        Ok(outcome)
    }

    /// Submit a block we just mined ourselves; the proof is left alone
    async fn submit_mined(&self, block: &Block) -> ServiceResult<SubmitOutcome> {
        self.admit(block, true).await
    }

    async fn admit(&self, block: &Block, do_check: bool) -> ServiceResult<SubmitOutcome> {
        let mut forks = self.forks.lock().await;
        let outcome = forks.submit(block, do_check).await?;
        if !outcome.promoted.is_empty() {
            tracing::info!(promoted = ?outcome.promoted, "branch stabilized");
        }
        Ok(outcome)
    }

    /// Validate a block against the working view without applying it
    pub async fn check_block(&self, block: &Block) -> ServiceResult<()> {
        Ok(self.working().await.check_block(block, true).await?)
    }

    // ==================== READS ====================

    pub async fn current(&self) -> ServiceResult<Option<Block>> {
        Ok(self.working().await.current().await?)
    }

    /// Confirmed block at a height
    pub async fn promoted(&self, number: BlockNumber) -> ServiceResult<Block> {
        let forks = self.forks.lock().await;
        Ok(forks.main_context().promoted(number).await?)
    }

    /// Tip block of every branch
    pub async fn branches(&self) -> ServiceResult<Vec<Block>> {
        let forks = self.forks.lock().await;
        let mut blocks = Vec::new();
        for core in forks.branches() {
            if let Some(block) = core.context.current().await? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    // ==================== GENERATION ====================

    /// Assemble the next candidate block from the pending pools
    pub async fn generate_next(&self) -> ServiceResult<Block> {
        let keypair = self.require_keypair()?;
        let assembler = self.assembler(self.working().await);
        Ok(assembler
            .assemble(&NextBlockPolicy, keypair.pubkey(), chain_core::now())
            .await?)
    }

    /// Assemble a documentless next block
    pub async fn generate_empty_next(&self) -> ServiceResult<Block> {
        let keypair = self.require_keypair()?;
        let assembler = self.assembler(self.working().await);
        Ok(assembler
            .assemble_empty(keypair.pubkey(), chain_core::now())
            .await?)
    }

    /// Assemble the root block with operator-selected joiners
    pub async fn generate_manual_root(
        &self,
        selector: impl Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    ) -> ServiceResult<Block> {
        if self.current().await?.is_some() {
            return Err(ServiceError::ChainAlreadyStarted);
        }
        let keypair = self.require_keypair()?;
        let assembler = self.assembler(self.working().await);
        let policy = ManualRootPolicy::new(selector);
        Ok(assembler
            .assemble(&policy, keypair.pubkey(), chain_core::now())
            .await?)
    }

    /// Assemble (unless given), prove and submit the next block.
    /// `None` means the proof was cancelled by an incoming block.
    pub async fn make_next_block(
        &self,
        block: Option<Block>,
        trial: Option<u32>,
    ) -> ServiceResult<Option<Block>> {
        let keypair = self.require_keypair()?;
        let block = match block {
            Some(block) => block,
            None => self.generate_next().await?,
        };
        let zeros = match trial {
            Some(zeros) => zeros,
            None => {
                let working = self.working().await;
                let personal = working.trial_level(&keypair.pubkey()).await?;
                block.pow_min.max(personal)
            }
        };
        match self.prove(block, zeros).await? {
            Some(proved) => {
                self.submit_mined(&proved).await?;
                Ok(Some(proved))
            }
            None => Ok(None),
        }
    }

    /// Run the proof worker over a block at the given difficulty
    pub async fn prove(&self, block: Block, zeros: u32) -> ServiceResult<Option<Block>> {
        let keypair = self.require_keypair()?;
        let request = ProofRequest {
            block,
            zeros,
            secret_b58: keypair.secret().to_base58(),
            cpu: self.config.cpu,
        };
        Ok(self.pow.prove(request).await?)
    }

    /// Start the continuous generation loop
    pub fn start_generation(self: Arc<Self>) -> ServiceResult<tokio::task::JoinHandle<()>> {
        if !self.config.participate {
            return Err(ServiceError::GenerationDisabled);
        }
        let keypair = self.require_keypair()?;
        self.stop_asked.store(false, Ordering::Relaxed);
        tracing::info!("block generation started");
        Ok(tokio::spawn(async move {
            self.generation_loop(keypair).await;
        }))
    }

    /// Stop mining: cancels the in-flight proof and ends the loop
    pub async fn stop_proof(&self) {
        self.stop_asked.store(true, Ordering::Relaxed);
        self.pow.stop_proof().await;
    }

    async fn generation_loop(&self, keypair: Arc<KeyPair>) {
        let retry = Duration::from_secs(self.config.params.avg_gen_time.clamp(1, 300));
        loop {
            if self.stop_asked.load(Ordering::Relaxed) {
                tracing::info!("block generation stopped");
                return;
            }
            match self.generation_step(&keypair, retry).await {
                Ok(()) => {}
                Err(ServiceError::Consensus(ConsensusError::AlreadyKnown)) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "generation step failed");
                    self.pow.wait_before_proof(retry).await;
                }
            }
        }
    }

    /// One pass of the mining preconditions and, when eligible, one proof
    async fn generation_step(
        &self,
        keypair: &KeyPair,
        retry: Duration,
    ) -> ServiceResult<()> {
        let working = self.working().await;
        let Some(current) = working.current().await? else {
            // The root block is an operator action
            self.pow.wait_before_proof(retry).await;
            return Ok(());
        };
        if working
            .dal()
            .require_member_non_leaver(&keypair.pubkey())
            .await
            .is_err()
        {
            self.pow.wait_before_proof(retry).await;
            return Ok(());
        }
        if current.issuer == keypair.pubkey() && self.config.pow_delay > 0 {
            // Hold off after our own block; broken early by a new one
            if !self
                .pow
                .wait_before_proof(Duration::from_secs(self.config.pow_delay))
                .await
            {
                return Ok(());
            }
        }
        let trial = working.trial_level(&keypair.pubkey()).await?;
        if trial > current.pow_min + 1 {
            tracing::debug!(trial, pow_min = current.pow_min, "deferred: trial too high");
            self.pow.wait_before_proof(retry).await;
            return Ok(());
        }

        let assembler = self.assembler(working);
        let block = assembler
            .assemble(&NextBlockPolicy, keypair.pubkey(), chain_core::now())
            .await?;
        let zeros = block.pow_min.max(trial);
        match self.prove(block, zeros).await? {
            Some(proved) => {
                self.submit_mined(&proved).await?;
                tracing::info!(number = proved.number, "self-mined block accepted");
            }
            None => {
                tracing::debug!("proof cancelled by incoming block");
            }
        }
        Ok(())
    }

    // ==================== PENDING DOCUMENT INGESTION ====================

    pub async fn submit_identity(&self, identity: &InlineIdentity) -> ServiceResult<()> {
        identity
            .pubkey
            .verify(identity.message().as_bytes(), &identity.signature)?;
        let forks = self.forks.lock().await;
        forks.main_context().dal().save_pending_identity(identity).await?;
        Ok(())
    }

    pub async fn submit_membership(&self, membership: &Membership) -> ServiceResult<()> {
        membership
            .issuer
            .verify(membership.message().as_bytes(), &membership.signature)?;
        let forks = self.forks.lock().await;
        forks
            .main_context()
            .dal()
            .save_pending_membership(membership)
            .await?;
        Ok(())
    }

    pub async fn submit_certification(
        &self,
        cert: &Certification,
        target_digest: &str,
    ) -> ServiceResult<()> {
        cert.from.verify(cert.message().as_bytes(), &cert.signature)?;
        let forks = self.forks.lock().await;
        forks
            .main_context()
            .dal()
            .save_pending_cert(&PendingCert {
                cert: cert.clone(),
                target_digest: target_digest.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn submit_transaction(&self, tx: &Transaction) -> ServiceResult<()> {
        tx.check_structure()?;
        tx.check_signatures()?;
        let forks = self.forks.lock().await;
        forks.main_context().dal().save_pending_transaction(tx).await?;
        Ok(())
    }

    // ==================== DERIVED QUERIES ====================

    /// What a pending identity still needs to become a member
    pub async fn requirements_of_identity(
        &self,
        identity: &InlineIdentity,
    ) -> ServiceResult<IdentityRequirements> {
        let assembler = self.assembler(self.working().await);
        Ok(assembler.requirements(identity).await?)
    }

    pub fn pow_stats(&self) -> PowStats {
        self.pow.stats()
    }

    /// Highest confirmed block whose certifications are expired at the
    /// current median time
    pub async fn certifications_excluding_block(&self) -> ServiceResult<Option<BlockNumber>> {
        let forks = self.forks.lock().await;
        let main = forks.main_context();
        let Some(current) = main.current().await? else {
            return Ok(None);
        };
        let horizon = current
            .median_time
            .saturating_sub(self.config.params.sig_validity);
        let mut excluding = None;
        for number in 0..=current.number {
            let block = main.block(number).await?;
            if block.median_time < horizon {
                excluding = Some(number);
            } else {
                break;
            }
        }
        Ok(excluding)
    }

    // ==================== STATS & TX RECORDS ====================

    /// Recompute the per-counter statistics over newly confirmed blocks
    pub async fn compute_stats(&self) -> ServiceResult<()> {
        let _queue = self.stat_queue.lock().await;
        let main = {
            let forks = self.forks.lock().await;
            forks.main_context().clone()
        };
        let Some(current) = main.current().await? else {
            return Ok(());
        };
        let dal = main.dal();

        for name in STAT_NAMES {
            let mut stat = dal.stat(name).await?.unwrap_or_default();
            let start = stat.last_parsed_block.map(|n| n + 1).unwrap_or(0);
            for number in start..=current.number {
                let block = main.block(number).await?;
                if stat_contribution(name, &block) {
                    stat.blocks.push(number);
                }
            }
            stat.last_parsed_block = Some(current.number);
            dal.save_stat(name, &stat).await?;
        }
        tracing::debug!(up_to = current.number, "statistics recomputed");
        Ok(())
    }

    pub async fn stat(&self, name: &str) -> ServiceResult<Option<Stat>> {
        let forks = self.forks.lock().await;
        Ok(forks.main_context().dal().stat(name).await?)
    }

    /// Drop and rebuild the transaction records from the confirmed chain
    pub async fn recompute_tx_records(&self) -> ServiceResult<usize> {
        let main = {
            let forks = self.forks.lock().await;
            forks.main_context().clone()
        };
        let dal = main.dal();
        dal.drop_tx_records().await?;
        let Some(current) = main.current().await? else {
            return Ok(0);
        };
        let mut count = 0usize;
        for number in 0..=current.number {
            let block = main.block(number).await?;
            for tx in &block.transactions {
                dal.save_tx_record(&TxRecord {
                    tx_hash: tx.hash(),
                    block_number: number,
                    issuers: tx.issuers.clone(),
                    amount: tx.total_outputs(),
                    comment: tx.comment.clone(),
                    written_time: block.median_time,
                })
                .await?;
                count += 1;
            }
        }
        dal.flush_tx_records().await?;
        tracing::info!(count, "transaction records rebuilt");
        Ok(count)
    }
}

/// Whether a block contributes to a named counter
fn stat_contribution(name: &str, block: &Block) -> bool {
    match name {
        "newcomers" => !block.identities.is_empty(),
        "certs" => !block.certifications.is_empty(),
        "joiners" => !block.joiners.is_empty(),
        "actives" => !block.actives.is_empty(),
        "leavers" => !block.leavers.is_empty(),
        "excluded" => !block.excluded.is_empty(),
        "ud" => block.dividend.is_some(),
        "tx" => !block.transactions.is_empty(),
        _ => false,
    }
}
