// consensus/src/context.rs

//! Chain context: the validators bound to one DAL view.

use crate::{global::GlobalValidator, local, ConsensusResult};
use chain_core::{
    Block, BlockNumber, Identity, Link, ProtocolParameters, Timestamp, TxSource,
};
use std::collections::HashSet;
use std::sync::Arc;
use storage::{BlockDelta, BlockchainDao};
use wot_crypto::Pubkey;

/// One DAL view plus the protocol parameters ruling it
#[derive(Clone)]
pub struct ChainContext {
    dal: Arc<dyn BlockchainDao>,
    params: ProtocolParameters,
}

impl ChainContext {
    pub fn new(dal: Arc<dyn BlockchainDao>, params: ProtocolParameters) -> Self {
        Self { dal, params }
    }

    pub fn dal(&self) -> &Arc<dyn BlockchainDao> {
        &self.dal
    }

    pub fn params(&self) -> &ProtocolParameters {
        &self.params
    }

    pub async fn current(&self) -> ConsensusResult<Option<Block>> {
        Ok(self.dal.current().await?)
    }

    pub async fn block(&self, number: BlockNumber) -> ConsensusResult<Block> {
        Ok(self.dal.block(number).await?)
    }

    pub async fn promoted(&self, number: BlockNumber) -> ConsensusResult<Block> {
        Ok(self.dal.promoted(number).await?)
    }

    pub async fn pow_min_for(&self, number: BlockNumber) -> ConsensusResult<u32> {
        GlobalValidator::new(self.dal.as_ref(), &self.params)
            .pow_min_for(number)
            .await
    }

    pub async fn median_time_for(&self, number: BlockNumber) -> ConsensusResult<Timestamp> {
        GlobalValidator::new(self.dal.as_ref(), &self.params)
            .median_time_for(number)
            .await
    }

    pub async fn trial_level(&self, issuer: &Pubkey) -> ConsensusResult<u32> {
        GlobalValidator::new(self.dal.as_ref(), &self.params)
            .trial_level(issuer)
            .await
    }

    /// Structural then contextual validation of a candidate block
    pub async fn check_block(&self, block: &Block, with_sig_and_pow: bool) -> ConsensusResult<()> {
        local::check_block_structure(block)?;
        GlobalValidator::new(self.dal.as_ref(), &self.params)
            .check_block(block, with_sig_and_pow)
            .await
    }

    /// Validate (optionally) and apply a block to this view
    ///
    /// Side effects are computed up front and committed in a single DAL
    /// transaction: either the whole block lands or none of it does.
    pub async fn add_block(&self, block: &Block, do_check: bool) -> ConsensusResult<Block> {
        if do_check {
            self.check_block(block, true).await?;
        }
        let delta = self.build_delta(block).await?;
        self.dal.apply_block(block, &delta).await?;
        tracing::info!(
            number = block.number,
            hash = %block.hash(),
            issuer = %block.issuer,
            "block added"
        );
        Ok(block.clone())
    }

    /// Translate a block into its DAL side effects
    async fn build_delta(&self, block: &Block) -> ConsensusResult<BlockDelta> {
        let mut delta = BlockDelta::default();

        for inline in &block.identities {
            delta.new_identities.push(Identity::from_inline(inline));
        }
        for joiner in &block.joiners {
            delta
                .joiners
                .push((joiner.issuer, joiner.number, joiner.certts));
        }
        for active in &block.actives {
            delta
                .actives
                .push((active.issuer, active.number, active.certts));
        }
        for leaver in &block.leavers {
            delta
                .leavers
                .push((leaver.issuer, leaver.number, leaver.certts));
        }
        delta.excluded = block.excluded.clone();

        for cert in &block.certifications {
            delta.new_links.push(Link {
                from: cert.from,
                to: cert.to,
                timestamp: block.median_time,
            });
        }

        for tx in &block.transactions {
            for input in &tx.inputs {
                delta.consumed_sources.push(input.source.clone());
            }
            let tx_hash = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                delta.new_sources.push((
                    TxSource::Output {
                        tx_hash,
                        index: index as u32,
                    },
                    output.amount,
                ));
            }
        }

        // Dividend sources are credited to the post-block member set
        if let Some(dividend) = block.dividend {
            let excluded: HashSet<&Pubkey> = block.excluded.iter().collect();
            let mut beneficiaries: HashSet<Pubkey> = self
                .dal
                .members()
                .await?
                .into_iter()
                .map(|i| i.pubkey)
                .collect();
            for joiner in &block.joiners {
                beneficiaries.insert(joiner.issuer);
            }
            for pubkey in beneficiaries {
                if excluded.contains(&pubkey) {
                    continue;
                }
                delta.new_sources.push((
                    TxSource::Dividend {
                        pubkey,
                        block: block.number,
                    },
                    dividend,
                ));
            }
        }

        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{InlineIdentity, Membership, MembershipKind, BLOCK_VERSION};
    use storage::MemoryDal;
    use wot_crypto::{Hash, KeyPair, Signature};

    fn root_with_member(kp: &KeyPair) -> Block {
        let idty = InlineIdentity {
            pubkey: kp.pubkey(),
            signature: Signature::empty(),
            time: 1000,
            uid: "alice".into(),
        };
        let joiner = Membership {
            issuer: kp.pubkey(),
            signature: Signature::empty(),
            number: 0,
            certts: 1000,
            userid: "alice".into(),
            membership: MembershipKind::In,
        };
        Block {
            version: BLOCK_VERSION,
            currency: "wotcoin".into(),
            number: 0,
            pow_min: 0,
            time: 1000,
            median_time: 1000,
            dividend: None,
            ud_time: None,
            issuer: kp.pubkey(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(ProtocolParameters::default()),
            members_count: 1,
            monetary_mass: 0,
            identities: vec![idty],
            joiners: vec![joiner],
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![],
            transactions: vec![],
            nonce: 0,
            signature: Signature::empty(),
        }
    }

    #[tokio::test]
    async fn test_add_block_applies_memberships() {
        let dal: Arc<dyn BlockchainDao> = Arc::new(MemoryDal::new());
        let context = ChainContext::new(dal.clone(), ProtocolParameters::default());
        let kp = KeyPair::generate();

        context.add_block(&root_with_member(&kp), false).await.unwrap();
        assert!(dal.is_member(&kp.pubkey()).await.unwrap());
        let identity = dal.identity_by_uid("alice").await.unwrap().unwrap();
        assert_eq!(identity.current_msn, 0);
    }

    #[tokio::test]
    async fn test_dividend_creates_sources() {
        let dal: Arc<dyn BlockchainDao> = Arc::new(MemoryDal::new());
        let context = ChainContext::new(dal.clone(), ProtocolParameters::default());
        let kp = KeyPair::generate();
        let root = root_with_member(&kp);
        context.add_block(&root, false).await.unwrap();

        let mut next = root.clone();
        next.number = 1;
        next.previous_hash = Some(root.hash());
        next.previous_issuer = Some(root.issuer);
        next.parameters = None;
        next.identities = vec![];
        next.joiners = vec![];
        next.dividend = Some(100);
        next.ud_time = Some(2000);
        next.monetary_mass = 100;
        context.add_block(&next, false).await.unwrap();

        let source = TxSource::Dividend {
            pubkey: kp.pubkey(),
            block: 1,
        };
        assert_eq!(dal.source_amount(&source).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_rejected_block_leaves_view_untouched() {
        let dal: Arc<dyn BlockchainDao> = Arc::new(MemoryDal::new());
        let context = ChainContext::new(dal.clone(), ProtocolParameters::default());
        let kp = KeyPair::generate();
        let mut bad = root_with_member(&kp);
        bad.previous_hash = Some(Hash::zero()); // root with a parent reference

        assert!(context.add_block(&bad, true).await.is_err());
        assert!(context.current().await.unwrap().is_none());
        assert!(!dal.is_member(&kp.pubkey()).await.unwrap());
    }
}
