// consensus/src/global.rs

//! Global validation: checks against a given chain view.

use crate::{local, wot::WotGraph, ConsensusError, ConsensusResult};
use chain_core::{
    Amount, Block, BlockNumber, Certification, ProtocolParameters, Timestamp,
};
use std::collections::HashSet;
use storage::BlockchainDao;
use wot_crypto::Pubkey;

/// Validator bound to one read view of the chain
pub struct GlobalValidator<'a> {
    dal: &'a dyn BlockchainDao,
    params: &'a ProtocolParameters,
}

impl<'a> GlobalValidator<'a> {
    pub fn new(dal: &'a dyn BlockchainDao, params: &'a ProtocolParameters) -> Self {
        Self { dal, params }
    }

    /// Expected median time of the block at `number` (>= 1): median of the
    /// previous `median_time_blocks` block times, floored at the parent's
    /// median time
    pub async fn median_time_for(&self, number: BlockNumber) -> ConsensusResult<Timestamp> {
        if number == 0 {
            return Err(ConsensusError::PreviousNotFound);
        }
        let count = self.params.median_time_blocks.max(1).min(number);
        let mut times = Vec::with_capacity(count as usize);
        for n in (number - count)..number {
            times.push(self.dal.block(n).await?.time);
        }
        times.sort_unstable();
        let median = if times.len() % 2 == 1 {
            times[times.len() / 2]
        } else {
            (times[times.len() / 2 - 1] + times[times.len() / 2]) / 2
        };
        let parent = self.dal.block(number - 1).await?;
        Ok(median.max(parent.median_time))
    }

    /// Difficulty floor for the block at `number`, re-evaluated every
    /// `dt_diff_eval` blocks from the observed issuance speed
    pub async fn pow_min_for(&self, number: BlockNumber) -> ConsensusResult<u32> {
        if number == 0 {
            return Ok(0);
        }
        let previous = self.dal.block(number - 1).await?.pow_min;
        let window = self.params.dt_diff_eval;
        if window == 0 || number < window || number % window != 0 {
            return Ok(previous);
        }
        let head = self.dal.block(number - 1).await?;
        let tail = self.dal.block(number - window).await?;
        let duration = head.median_time.saturating_sub(tail.median_time).max(1);
        let speed = (window.saturating_sub(1)).max(1) as f64 / duration as f64;
        let nominal = 1.0 / self.params.avg_gen_time as f64;
        Ok(if speed >= nominal * 4.0 / 3.0 {
            previous + 1
        } else if speed <= nominal * 2.0 / 3.0 {
            previous.saturating_sub(1)
        } else {
            previous
        })
    }

    /// Personal difficulty of an issuer for the next block: the schedule
    /// floor plus a handicap for blocks issued inside the rotation window
    /// beyond the `percent_rot` allowance
    pub async fn trial_level(&self, issuer: &Pubkey) -> ConsensusResult<u32> {
        let current = match self.dal.current().await? {
            Some(current) => current,
            None => return Ok(0),
        };
        let next = current.number + 1;
        let base = self.pow_min_for(next).await?;
        let window = self.params.blocks_rot.min(next);
        let mut issued = 0u64;
        for n in (next - window)..next {
            if self.dal.block(n).await?.issuer == *issuer {
                issued += 1;
            }
        }
        let allowance =
            ((1.0 - self.params.percent_rot) * self.params.blocks_rot as f64).floor() as u64;
        Ok(base + issued.saturating_sub(allowance) as u32)
    }

    /// Dividend due at `median_time` for a block with `members_count`
    /// members, with the new `ud_time` when one is due
    pub async fn expected_dividend(
        &self,
        members_count: u64,
        median_time: Timestamp,
        is_root: bool,
    ) -> ConsensusResult<Option<(Amount, Timestamp)>> {
        if is_root || members_count == 0 {
            return Ok(None);
        }
        let (previous_ud, last_time) = match self.dal.last_ud_block().await? {
            Some(block) => (
                block.dividend.unwrap_or(self.params.ud0),
                block.ud_time.unwrap_or(block.median_time),
            ),
            None => (self.params.ud0, self.dal.block(0).await?.median_time),
        };
        if last_time + self.params.dt > median_time {
            return Ok(None);
        }
        let mass = self
            .dal
            .current()
            .await?
            .map(|c| c.monetary_mass)
            .unwrap_or(0);
        let economic = self.params.c * mass as f64 / members_count as f64;
        let amount = (previous_ud as f64).max(economic).ceil() as Amount;
        Ok(Some((amount, last_time + self.params.dt)))
    }

    /// Validate one certification against the view: basis block exists,
    /// freshness under `sig_validity`, no replay of a link still alive
    /// under `sig_delay`
    pub async fn check_certification(
        &self,
        cert: &Certification,
        at_median: Timestamp,
        is_root: bool,
    ) -> ConsensusResult<()> {
        if is_root {
            if cert.basis != 0 {
                return Err(ConsensusError::UnknownBasisBlock(cert.basis));
            }
        } else {
            let basis = self
                .dal
                .block_opt(cert.basis)
                .await?
                .ok_or(ConsensusError::UnknownBasisBlock(cert.basis))?;
            if basis.median_time + self.params.sig_validity < at_median {
                return Err(ConsensusError::StaleCert {
                    from: cert.from,
                    to: cert.to,
                });
            }
        }
        let replay_floor = at_median.saturating_sub(self.params.sig_delay);
        if self
            .dal
            .link_exists_from_after(&cert.from, &cert.to, replay_floor)
            .await?
        {
            return Err(ConsensusError::ReplayedCert {
                from: cert.from,
                to: cert.to,
            });
        }
        Ok(())
    }

    /// Post-block WoT graph: links still valid at `median_time` plus the
    /// block's certifications
    pub async fn post_block_graph(
        &self,
        members: &[Pubkey],
        certifications: &[Certification],
        median_time: Timestamp,
    ) -> ConsensusResult<WotGraph> {
        let min_link_time = median_time.saturating_sub(self.params.sig_validity);
        let mut graph = WotGraph::new();
        for member in members {
            for link in self.dal.valid_links_from(member, min_link_time).await? {
                graph.add_edge(link.from, link.to);
            }
        }
        for cert in certifications {
            graph.add_edge(cert.from, cert.to);
        }
        Ok(graph)
    }

    /// Full global check of a block against this view
    pub async fn check_block(&self, block: &Block, with_sig_and_pow: bool) -> ConsensusResult<()> {
        let current = self.dal.current().await?;

        match (&current, block.number) {
            (None, 0) => {}
            (None, _) => return Err(ConsensusError::PreviousNotFound),
            (Some(_), 0) => return Err(ConsensusError::PreviousNotFound),
            (Some(tip), number) => {
                if number != tip.number + 1 || block.previous_hash != Some(tip.hash()) {
                    return Err(ConsensusError::PreviousNotFound);
                }
                if block.previous_issuer != Some(tip.issuer) {
                    return Err(ConsensusError::BadPreviousIssuer);
                }
            }
        }

        if block.number > 0 {
            let expected = self.median_time_for(block.number).await?;
            if block.median_time != expected {
                return Err(ConsensusError::BadMedianTime {
                    expected,
                    got: block.median_time,
                });
            }
        }

        let expected_pow = self.pow_min_for(block.number).await?;
        if block.pow_min != expected_pow {
            return Err(ConsensusError::BadPowMin {
                expected: expected_pow,
                got: block.pow_min,
            });
        }

        if with_sig_and_pow {
            local::check_block_signatures(block)?;
            let zeros = block.hash().leading_zero_nibbles();
            if zeros < block.pow_min {
                return Err(ConsensusError::BadPoW {
                    required: block.pow_min,
                    got: zeros,
                });
            }
            let trial = self.trial_level(&block.issuer).await?;
            if zeros < trial {
                return Err(ConsensusError::BadPoW {
                    required: trial,
                    got: zeros,
                });
            }
        }

        let newcomers = self.check_memberships(block).await?;
        self.check_members_count(block, current.as_ref(), newcomers.len() as u64)?;
        self.check_dividend(block, current.as_ref()).await?;
        self.check_certifications(block, &newcomers).await?;
        self.check_wot(block, &newcomers).await?;
        self.check_transactions(block).await?;

        Ok(())
    }

    /// Membership transitions; returns the newcomer set
    async fn check_memberships(&self, block: &Block) -> ConsensusResult<Vec<Pubkey>> {
        for inline in &block.identities {
            if self.dal.identity_by_pubkey(&inline.pubkey).await?.is_some() {
                return Err(ConsensusError::PubkeyTaken(inline.pubkey));
            }
            if let Some(other) = self.dal.identity_by_uid(&inline.uid).await? {
                if other.pubkey != inline.pubkey {
                    return Err(ConsensusError::UidTaken(inline.uid.clone()));
                }
            }
        }

        let mut newcomers = Vec::new();
        for joiner in &block.joiners {
            match self.dal.identity_by_pubkey(&joiner.issuer).await? {
                Some(identity) if identity.member => {
                    return Err(ConsensusError::AlreadyMember(joiner.issuer));
                }
                Some(identity) => {
                    if (joiner.number as i64) <= identity.current_msn {
                        return Err(ConsensusError::WrongMsn(joiner.issuer));
                    }
                }
                None => {
                    let inline = block
                        .identities
                        .iter()
                        .find(|i| i.pubkey == joiner.issuer)
                        .ok_or_else(|| {
                            ConsensusError::BadStructure(format!(
                                "joiner {} has no identity on chain or in block",
                                joiner.issuer
                            ))
                        })?;
                    if let Some(other) = self.dal.identity_by_uid(&inline.uid).await? {
                        if other.pubkey != inline.pubkey {
                            return Err(ConsensusError::UidTaken(inline.uid.clone()));
                        }
                    }
                }
            }
            if joiner.certts + self.params.ms_validity < block.median_time {
                return Err(ConsensusError::StaleMembership(joiner.issuer));
            }
            newcomers.push(joiner.issuer);
        }

        for membership in block.actives.iter().chain(&block.leavers) {
            let identity = self
                .dal
                .identity_by_pubkey(&membership.issuer)
                .await?
                .filter(|i| i.member)
                .ok_or(ConsensusError::MembershipNonMember(membership.issuer))?;
            if (membership.number as i64) <= identity.current_msn {
                return Err(ConsensusError::WrongMsn(membership.issuer));
            }
            if membership.certts + self.params.ms_validity < block.median_time {
                return Err(ConsensusError::StaleMembership(membership.issuer));
            }
        }

        for pubkey in &block.excluded {
            let is_member = self
                .dal
                .identity_by_pubkey(pubkey)
                .await?
                .map(|i| i.member)
                .unwrap_or(false);
            if !is_member {
                return Err(ConsensusError::MembershipNonMember(*pubkey));
            }
        }

        Ok(newcomers)
    }

    fn check_members_count(
        &self,
        block: &Block,
        current: Option<&Block>,
        newcomers: u64,
    ) -> ConsensusResult<()> {
        let parent_count = current.map(|c| c.members_count).unwrap_or(0);
        let expected = parent_count + newcomers - block.excluded.len() as u64;
        if block.members_count != expected {
            return Err(ConsensusError::BadMembersCount {
                expected,
                got: block.members_count,
            });
        }
        Ok(())
    }

    async fn check_dividend(&self, block: &Block, current: Option<&Block>) -> ConsensusResult<()> {
        let expected = self
            .expected_dividend(block.members_count, block.median_time, block.is_root())
            .await?;
        let (expected_div, expected_ud_time) = match expected {
            Some((amount, time)) => (Some(amount), Some(time)),
            None => (None, None),
        };
        if block.dividend != expected_div || block.ud_time != expected_ud_time {
            return Err(ConsensusError::BadDividend {
                expected: expected_div,
                got: block.dividend,
            });
        }
        let parent_mass = current.map(|c| c.monetary_mass).unwrap_or(0);
        let expected_mass =
            parent_mass + expected_div.unwrap_or(0) * block.members_count;
        if block.monetary_mass != expected_mass {
            return Err(ConsensusError::BadDividend {
                expected: expected_div,
                got: block.dividend,
            });
        }
        Ok(())
    }

    async fn check_certifications(
        &self,
        block: &Block,
        newcomers: &[Pubkey],
    ) -> ConsensusResult<()> {
        for cert in &block.certifications {
            let from_is_member = self.dal.is_member(&cert.from).await?;
            if !from_is_member && !newcomers.contains(&cert.from) {
                return Err(ConsensusError::CertifierNotMember(cert.from));
            }
            let to_is_member = self.dal.is_member(&cert.to).await?;
            if !to_is_member && !newcomers.contains(&cert.to) {
                return Err(ConsensusError::CertifiedNotMember(cert.to));
            }
            self.check_certification(cert, block.median_time, block.is_root())
                .await?;
        }
        Ok(())
    }

    async fn check_wot(&self, block: &Block, newcomers: &[Pubkey]) -> ConsensusResult<()> {
        if newcomers.is_empty() {
            return Ok(());
        }
        let members: Vec<Pubkey> = self
            .dal
            .members()
            .await?
            .into_iter()
            .map(|i| i.pubkey)
            .collect();
        let graph = self
            .post_block_graph(&members, &block.certifications, block.median_time)
            .await?;
        let sentries = graph.sentries(&members, self.params.sig_wot);
        let min_link_time = block.median_time.saturating_sub(self.params.sig_validity);

        for newcomer in newcomers {
            let existing = self.dal.valid_links_to(newcomer, min_link_time).await?.len() as u64;
            let incoming = block
                .certifications
                .iter()
                .filter(|c| c.to == *newcomer)
                .count() as u64;
            if existing + incoming < self.params.sig_qty {
                return Err(ConsensusError::NotEnoughCertifications {
                    pubkey: *newcomer,
                    got: existing + incoming,
                    required: self.params.sig_qty,
                });
            }
            let failing = graph.outdistanced_sentries(&sentries, newcomer, self.params.step_max);
            if !failing.is_empty() {
                return Err(ConsensusError::Outdistanced {
                    pubkey: *newcomer,
                    failing: failing.len(),
                });
            }
        }
        Ok(())
    }

    async fn check_transactions(&self, block: &Block) -> ConsensusResult<()> {
        let mut consumed: HashSet<&chain_core::TxSource> = HashSet::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if !consumed.insert(&input.source) {
                    return Err(ConsensusError::UnavailableSource(
                        input.to_inline(),
                    ));
                }
                match self.dal.source_amount(&input.source).await? {
                    Some(amount) if amount == input.amount => {}
                    _ => {
                        return Err(ConsensusError::UnavailableSource(input.to_inline()));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::BLOCK_VERSION;
    use storage::{BlockDelta, MemoryDal};
    use wot_crypto::{Hash, KeyPair, Signature};

    fn empty_block(number: BlockNumber, issuer: Pubkey, time: Timestamp) -> Block {
        Block {
            version: BLOCK_VERSION,
            currency: "wotcoin".into(),
            number,
            pow_min: 0,
            time,
            median_time: time,
            dividend: None,
            ud_time: None,
            issuer,
            previous_hash: (number > 0).then(Hash::zero),
            previous_issuer: (number > 0).then_some(issuer),
            parameters: (number == 0).then(ProtocolParameters::default),
            members_count: 0,
            monetary_mass: 0,
            identities: vec![],
            joiners: vec![],
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![],
            transactions: vec![],
            nonce: 0,
            signature: Signature::empty(),
        }
    }

    async fn seed_chain(dal: &MemoryDal, issuer: Pubkey, times: &[Timestamp]) {
        for (n, time) in times.iter().enumerate() {
            let mut block = empty_block(n as BlockNumber, issuer, *time);
            if n > 0 {
                block.median_time = times[..n].iter().sum::<u64>() / n as u64;
            }
            dal.apply_block(&block, &BlockDelta::default()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_median_time_is_floored_by_parent() {
        let dal = MemoryDal::new();
        let kp = KeyPair::generate();
        let params = ProtocolParameters {
            median_time_blocks: 3,
            ..Default::default()
        };
        // Parent median higher than the raw median of times
        let mut b0 = empty_block(0, kp.pubkey(), 1000);
        b0.median_time = 1000;
        dal.apply_block(&b0, &BlockDelta::default()).await.unwrap();
        let mut b1 = empty_block(1, kp.pubkey(), 900);
        b1.median_time = 1200;
        dal.apply_block(&b1, &BlockDelta::default()).await.unwrap();

        let validator = GlobalValidator::new(&dal, &params);
        // Raw median of times [1000, 900] is 950, parent floor is 1200
        assert_eq!(validator.median_time_for(2).await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn test_pow_min_steps_up_when_fast() {
        let dal = MemoryDal::new();
        let kp = KeyPair::generate();
        let params = ProtocolParameters {
            dt_diff_eval: 4,
            avg_gen_time: 100,
            ..Default::default()
        };
        // Four blocks one second apart: far above nominal speed
        for n in 0..4u64 {
            let mut block = empty_block(n, kp.pubkey(), 1000 + n);
            block.median_time = 1000 + n;
            dal.apply_block(&block, &BlockDelta::default()).await.unwrap();
        }
        let validator = GlobalValidator::new(&dal, &params);
        assert_eq!(validator.pow_min_for(4).await.unwrap(), 1);
        // Off the re-evaluation point the previous floor sticks
        assert_eq!(validator.pow_min_for(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trial_level_penalizes_greedy_issuer() {
        let dal = MemoryDal::new();
        let kp = KeyPair::generate();
        let params = ProtocolParameters {
            blocks_rot: 4,
            percent_rot: 0.5,
            dt_diff_eval: 1000,
            ..Default::default()
        };
        seed_chain(&dal, kp.pubkey(), &[1000, 1010, 1020, 1030]).await;
        let validator = GlobalValidator::new(&dal, &params);

        // Issuer signed all 4 blocks of the window, allowance is 2
        assert_eq!(validator.trial_level(&kp.pubkey()).await.unwrap(), 2);
        let other = KeyPair::generate();
        assert_eq!(validator.trial_level(&other.pubkey()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dividend_schedule() {
        let dal = MemoryDal::new();
        let kp = KeyPair::generate();
        let params = ProtocolParameters {
            dt: 100,
            ud0: 50,
            c: 0.1,
            ..Default::default()
        };
        let mut b0 = empty_block(0, kp.pubkey(), 1000);
        b0.median_time = 1000;
        dal.apply_block(&b0, &BlockDelta::default()).await.unwrap();

        let validator = GlobalValidator::new(&dal, &params);
        // Not yet due
        assert_eq!(
            validator.expected_dividend(3, 1050, false).await.unwrap(),
            None
        );
        // Due: first dividend is ud0
        assert_eq!(
            validator.expected_dividend(3, 1100, false).await.unwrap(),
            Some((50, 1100))
        );
    }

    #[tokio::test]
    async fn test_check_block_rejects_unknown_parent() {
        let dal = MemoryDal::new();
        let kp = KeyPair::generate();
        let params = ProtocolParameters::default();
        seed_chain(&dal, kp.pubkey(), &[1000]).await;

        let validator = GlobalValidator::new(&dal, &params);
        let mut orphan = empty_block(5, kp.pubkey(), 1100);
        orphan.previous_hash = Some(Hash::zero());
        assert!(matches!(
            validator.check_block(&orphan, false).await,
            Err(ConsensusError::PreviousNotFound)
        ));
    }
}
