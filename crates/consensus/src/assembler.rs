// consensus/src/assembler.rs

//! Block assembly: selecting joiners, certifications, leavers and
//! transactions for the next candidate block.

use crate::{global::GlobalValidator, ChainContext, ConsensusError, ConsensusResult};
use async_trait::async_trait;
use chain_core::{
    Block, Certification, Identity, InlineIdentity, Membership, Timestamp, BLOCK_VERSION,
};
use std::collections::HashSet;
use storage::{BlockchainDao, PendingCert};
use wot_crypto::{sha1_hex_upper, Pubkey, Signature};

/// A vetted joiner candidate: membership, identity and its usable
/// certifications
#[derive(Debug, Clone)]
pub struct PreJoin {
    pub identity: InlineIdentity,
    pub membership: Membership,
    pub certs: Vec<Certification>,
    /// Chain identity when the joiner is coming back
    pub known: Option<Identity>,
}

/// Strategy bundle parameterizing the assembler
#[async_trait]
pub trait GenerationPolicy: Send + Sync {
    /// Filter the candidate joiners in place
    async fn filter_joiners(
        &self,
        dal: &dyn BlockchainDao,
        candidates: &mut Vec<PreJoin>,
    ) -> ConsensusResult<()>;

    /// Certifications between existing members to merge into the block
    async fn member_certs(&self, dal: &dyn BlockchainDao) -> ConsensusResult<Vec<PendingCert>>;
}

/// Automatic policy for a running chain
pub struct NextBlockPolicy;

#[async_trait]
impl GenerationPolicy for NextBlockPolicy {
    async fn filter_joiners(
        &self,
        dal: &dyn BlockchainDao,
        candidates: &mut Vec<PreJoin>,
    ) -> ConsensusResult<()> {
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            let identity = &candidate.identity;
            if let Some(other) = dal.identity_by_uid(&identity.uid).await? {
                if other.pubkey != identity.pubkey && !other.was_member {
                    tracing::debug!(uid = %identity.uid, "joiner dropped: uid taken");
                    continue;
                }
            }
            if let Some(other) = dal.identity_by_pubkey(&identity.pubkey).await? {
                if other.uid != identity.uid && !other.was_member {
                    tracing::debug!(pubkey = %identity.pubkey, "joiner dropped: pubkey taken");
                    continue;
                }
            }
            kept.push(candidate);
        }
        *candidates = kept;
        Ok(())
    }

    async fn member_certs(&self, dal: &dyn BlockchainDao) -> ConsensusResult<Vec<PendingCert>> {
        Ok(dal.certs_for_members().await?)
    }
}

/// Operator-driven policy for the root block: only selected uids join
pub struct ManualRootPolicy {
    selector: Box<dyn Fn(&[String]) -> Vec<String> + Send + Sync>,
}

impl ManualRootPolicy {
    pub fn new(selector: impl Fn(&[String]) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            selector: Box::new(selector),
        }
    }

    /// Keep every candidate
    pub fn accept_all() -> Self {
        Self::new(|uids| uids.to_vec())
    }
}

#[async_trait]
impl GenerationPolicy for ManualRootPolicy {
    async fn filter_joiners(
        &self,
        _dal: &dyn BlockchainDao,
        candidates: &mut Vec<PreJoin>,
    ) -> ConsensusResult<()> {
        let uids: Vec<String> = candidates.iter().map(|c| c.identity.uid.clone()).collect();
        let selected: HashSet<String> = (self.selector)(&uids).into_iter().collect();
        candidates.retain(|c| selected.contains(&c.identity.uid));
        Ok(())
    }

    async fn member_certs(&self, _dal: &dyn BlockchainDao) -> ConsensusResult<Vec<PendingCert>> {
        Ok(vec![])
    }
}

/// Membership requirements of one pending identity
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityRequirements {
    pub uid: String,
    pub pubkey: Pubkey,
    pub uid_taken: bool,
    pub pubkey_taken: bool,
    pub valid_certifications: u64,
    pub required_certifications: u64,
    pub membership_pending: bool,
    pub outdistanced: bool,
}

/// Builds unsigned candidate blocks from the working view
pub struct BlockAssembler {
    context: ChainContext,
    currency: String,
    root_offset: u64,
}

impl BlockAssembler {
    pub fn new(context: ChainContext, currency: impl Into<String>, root_offset: u64) -> Self {
        Self {
            context,
            currency: currency.into(),
            root_offset,
        }
    }

    /// Assemble the next candidate block under the given policy
    pub async fn assemble(
        &self,
        policy: &dyn GenerationPolicy,
        issuer: Pubkey,
        now: Timestamp,
    ) -> ConsensusResult<Block> {
        let dal = self.context.dal().as_ref();
        let params = self.context.params();
        let validator = GlobalValidator::new(dal, params);

        let current = dal.current().await?;
        let next_number = current.as_ref().map(|c| c.number + 1).unwrap_or(0);
        let is_root = next_number == 0;
        let median_time = if is_root {
            now.saturating_sub(self.root_offset)
        } else {
            validator.median_time_for(next_number).await?
        };

        let members: Vec<Pubkey> = dal.members().await?.iter().map(|i| i.pubkey).collect();

        // Joiner preflight, then policy filter, then WoT-stability selection
        let (mut prejoins, actives) = self.pre_join_data(median_time, is_root).await?;
        policy.filter_joiners(dal, &mut prejoins).await?;
        let selected = self
            .iterated_selection(prejoins, &members, median_time)
            .await?;
        let eligible: HashSet<Pubkey> = selected.iter().map(|j| j.identity.pubkey).collect();
        let mut certifications = new_links(&selected, &members, &eligible);

        // Certifications between existing members; joiner certs keep priority
        let mut certifiers: HashSet<Pubkey> = certifications.iter().map(|c| c.from).collect();
        for pending in policy.member_certs(dal).await? {
            let cert = pending.cert;
            if certifiers.contains(&cert.from) {
                continue;
            }
            if !dal.is_member(&cert.from).await? || !dal.is_member(&cert.to).await? {
                continue;
            }
            if let Err(err) = validator
                .check_certification(&cert, median_time, is_root)
                .await
            {
                tracing::debug!(from = %cert.from, to = %cert.to, error = %err, "cert dropped");
                continue;
            }
            certifiers.insert(cert.from);
            certifications.push(cert);
        }

        // Leavers: OUT memberships of current members with a fresh MSN
        let mut leavers = Vec::new();
        for membership in dal.find_leavers().await? {
            if let Some(identity) = dal.identity_by_pubkey(&membership.issuer).await? {
                if identity.member && (membership.number as i64) > identity.current_msn {
                    leavers.push(membership);
                }
            }
        }

        let transactions = self.select_transactions().await?;

        // Exclusions: kicked members leave every other list of the block
        let excluded: Vec<Pubkey> = if is_root {
            vec![]
        } else {
            dal.to_be_kicked(
                median_time.saturating_sub(params.ms_validity),
                params.sig_qty,
                median_time.saturating_sub(params.sig_validity),
            )
            .await?
            .into_iter()
            .map(|i| i.pubkey)
            .collect()
        };
        let kicked: HashSet<&Pubkey> = excluded.iter().collect();
        let selected: Vec<PreJoin> = selected
            .into_iter()
            .filter(|j| !kicked.contains(&j.identity.pubkey))
            .collect();
        let actives: Vec<Membership> = actives
            .into_iter()
            .filter(|m| !kicked.contains(&m.issuer))
            .collect();
        let leavers: Vec<Membership> = leavers
            .into_iter()
            .filter(|m| !kicked.contains(&m.issuer))
            .collect();
        certifications.retain(|c| !kicked.contains(&c.to));

        let identities: Vec<InlineIdentity> = selected
            .iter()
            .filter(|j| j.known.is_none())
            .map(|j| j.identity.clone())
            .collect();
        let joiners: Vec<Membership> = selected.iter().map(|j| j.membership.clone()).collect();

        let parent_count = current.as_ref().map(|c| c.members_count).unwrap_or(0);
        let members_count = parent_count + joiners.len() as u64 - excluded.len() as u64;

        let dividend = validator
            .expected_dividend(members_count, median_time, is_root)
            .await?;
        let parent_mass = current.as_ref().map(|c| c.monetary_mass).unwrap_or(0);
        let (dividend, ud_time) = match dividend {
            Some((amount, time)) => (Some(amount), Some(time)),
            None => (None, None),
        };
        let monetary_mass = parent_mass + dividend.unwrap_or(0) * members_count;
        let pow_min = validator.pow_min_for(next_number).await?;

        certifications.sort_by_key(|c| (c.from.to_base58(), c.to.to_base58()));
        let mut excluded = excluded;
        excluded.sort_by_key(|p| p.to_base58());

        Ok(Block {
            version: BLOCK_VERSION,
            currency: self.currency.clone(),
            number: next_number,
            pow_min,
            time: now.max(median_time),
            median_time,
            dividend,
            ud_time,
            issuer,
            previous_hash: current.as_ref().map(|c| c.hash()),
            previous_issuer: current.as_ref().map(|c| c.issuer),
            parameters: is_root.then(|| params.clone()),
            members_count,
            monetary_mass,
            identities,
            joiners,
            actives,
            leavers,
            excluded,
            certifications,
            transactions,
            nonce: 0,
            signature: Signature::empty(),
        })
    }

    /// Assemble a documentless next block: correct header fields only
    pub async fn assemble_empty(&self, issuer: Pubkey, now: Timestamp) -> ConsensusResult<Block> {
        let dal = self.context.dal().as_ref();
        let params = self.context.params();
        let validator = GlobalValidator::new(dal, params);

        let current = dal.current().await?;
        let next_number = current.as_ref().map(|c| c.number + 1).unwrap_or(0);
        let is_root = next_number == 0;
        let median_time = if is_root {
            now.saturating_sub(self.root_offset)
        } else {
            validator.median_time_for(next_number).await?
        };
        let members_count = current.as_ref().map(|c| c.members_count).unwrap_or(0);
        let dividend = validator
            .expected_dividend(members_count, median_time, is_root)
            .await?;
        let (dividend, ud_time) = match dividend {
            Some((amount, time)) => (Some(amount), Some(time)),
            None => (None, None),
        };
        let parent_mass = current.as_ref().map(|c| c.monetary_mass).unwrap_or(0);

        Ok(Block {
            version: BLOCK_VERSION,
            currency: self.currency.clone(),
            number: next_number,
            pow_min: validator.pow_min_for(next_number).await?,
            time: now.max(median_time),
            median_time,
            dividend,
            ud_time,
            issuer,
            previous_hash: current.as_ref().map(|c| c.hash()),
            previous_issuer: current.as_ref().map(|c| c.issuer),
            parameters: is_root.then(|| params.clone()),
            members_count,
            monetary_mass: parent_mass + dividend.unwrap_or(0) * members_count,
            identities: vec![],
            joiners: vec![],
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![],
            transactions: vec![],
            nonce: 0,
            signature: Signature::empty(),
        })
    }

    /// What a pending identity still needs to become a member
    pub async fn requirements(
        &self,
        identity: &InlineIdentity,
    ) -> ConsensusResult<IdentityRequirements> {
        let dal = self.context.dal().as_ref();
        let params = self.context.params();
        let validator = GlobalValidator::new(dal, params);

        let current = dal.current().await?;
        let is_root = current.is_none();
        let median_time = current
            .as_ref()
            .map(|c| c.median_time)
            .unwrap_or_else(chain_core::now);

        let uid_taken = dal
            .identity_by_uid(&identity.uid)
            .await?
            .map(|other| other.pubkey != identity.pubkey)
            .unwrap_or(false);
        let pubkey_taken = dal
            .identity_by_pubkey(&identity.pubkey)
            .await?
            .map(|other| other.uid != identity.uid)
            .unwrap_or(false);

        let digest = identity.digest();
        let mut valid = Vec::new();
        let mut seen = HashSet::new();
        for pending in dal.certs_to_target(&digest).await? {
            let cert = pending.cert;
            if !seen.insert(cert.from) {
                continue;
            }
            if validator
                .check_certification(&cert, median_time, is_root)
                .await
                .is_ok()
            {
                valid.push(cert);
            }
        }

        let membership_pending = dal
            .memberships_for_issuer(&identity.pubkey)
            .await?
            .iter()
            .any(|m| m.membership == chain_core::MembershipKind::In);

        let members: Vec<Pubkey> = dal.members().await?.iter().map(|i| i.pubkey).collect();
        let graph = validator
            .post_block_graph(&members, &valid, median_time)
            .await?;
        let sentries = graph.sentries(&members, params.sig_wot);
        let outdistanced = !graph
            .outdistanced_sentries(&sentries, &identity.pubkey, params.step_max)
            .is_empty();

        Ok(IdentityRequirements {
            uid: identity.uid.clone(),
            pubkey: identity.pubkey,
            uid_taken,
            pubkey_taken,
            valid_certifications: valid.len() as u64,
            required_certifications: params.sig_qty,
            membership_pending,
            outdistanced,
        })
    }

    /// Resolve pending IN memberships into joiner candidates and renewals
    async fn pre_join_data(
        &self,
        median_time: Timestamp,
        is_root: bool,
    ) -> ConsensusResult<(Vec<PreJoin>, Vec<Membership>)> {
        let dal = self.context.dal().as_ref();
        let params = self.context.params();
        let validator = GlobalValidator::new(dal, params);

        let mut prejoins = Vec::new();
        let mut actives = Vec::new();
        for membership in dal.find_newcomers().await? {
            if membership.certts + params.ms_validity < median_time {
                tracing::debug!(uid = %membership.userid, "membership dropped: expired");
                continue;
            }
            let digest = sha1_hex_upper(&format!(
                "{}|{}|{}",
                membership.userid, membership.certts, membership.issuer
            ));
            let known = dal.identity_by_digest(&digest).await?;
            if let Some(identity) = &known {
                if (membership.number as i64) <= identity.current_msn {
                    tracing::debug!(uid = %membership.userid, "membership dropped: stale MSN");
                    continue;
                }
                if identity.member {
                    actives.push(membership);
                    continue;
                }
            }
            let inline = match &known {
                Some(identity) => identity.as_inline(),
                None => match dal.pending_identity_by_digest(&digest).await? {
                    Some(inline) => inline,
                    None => {
                        tracing::debug!(uid = %membership.userid, "membership dropped: unknown identity");
                        continue;
                    }
                },
            };

            let mut certs = Vec::new();
            let mut seen_pairs = HashSet::new();
            for pending in dal.certs_to_target(&digest).await? {
                let cert = pending.cert;
                if cert.to != inline.pubkey || cert.from == cert.to {
                    continue;
                }
                if !seen_pairs.insert((cert.from, cert.to)) {
                    continue;
                }
                if let Err(err) = validator
                    .check_certification(&cert, median_time, is_root)
                    .await
                {
                    tracing::debug!(from = %cert.from, error = %err, "candidate cert dropped");
                    continue;
                }
                certs.push(cert);
            }

            prejoins.push(PreJoin {
                identity: inline,
                membership,
                certs,
                known,
            });
        }
        Ok((prejoins, actives))
    }

    /// Iterated WoT-stability selection: run full passes, dropping
    /// candidates that fail, until one pass has no rejection
    ///
    /// The fixpoint is the maximal admissible set under input order; the
    /// passing set shrinks between passes, so this terminates.
    async fn iterated_selection(
        &self,
        mut candidates: Vec<PreJoin>,
        members: &[Pubkey],
        median_time: Timestamp,
    ) -> ConsensusResult<Vec<PreJoin>> {
        loop {
            // Certifier eligibility is judged against the whole pass, so
            // mutually-certifying candidates can support each other
            let eligible: HashSet<Pubkey> =
                candidates.iter().map(|j| j.identity.pubkey).collect();
            let mut passing: Vec<PreJoin> = Vec::new();
            let mut rejections = 0usize;
            for candidate in &candidates {
                let mut trial: Vec<PreJoin> = passing.clone();
                trial.push(candidate.clone());
                let links = new_links(&trial, members, &eligible);
                match self
                    .check_wot_constraints(&trial, &links, members, median_time)
                    .await
                {
                    Ok(()) => passing.push(candidate.clone()),
                    Err(err) => {
                        rejections += 1;
                        tracing::debug!(uid = %candidate.identity.uid, error = %err, "joiner rejected");
                    }
                }
            }
            if rejections == 0 || passing.is_empty() {
                return Ok(passing);
            }
            candidates = passing;
        }
    }

    /// Every newcomer of the trial set must gather `sig_qty` incoming
    /// links and stay reachable from every sentry
    async fn check_wot_constraints(
        &self,
        trial: &[PreJoin],
        links: &[Certification],
        members: &[Pubkey],
        median_time: Timestamp,
    ) -> ConsensusResult<()> {
        let dal = self.context.dal().as_ref();
        let params = self.context.params();
        let validator = GlobalValidator::new(dal, params);

        let graph = validator.post_block_graph(members, links, median_time).await?;
        let sentries = graph.sentries(members, params.sig_wot);
        let min_link_time = median_time.saturating_sub(params.sig_validity);

        for joiner in trial {
            let pubkey = joiner.identity.pubkey;
            let existing = dal.valid_links_to(&pubkey, min_link_time).await?.len() as u64;
            let incoming = links.iter().filter(|c| c.to == pubkey).count() as u64;
            if existing + incoming < params.sig_qty {
                return Err(ConsensusError::NotEnoughCertifications {
                    pubkey,
                    got: existing + incoming,
                    required: params.sig_qty,
                });
            }
            let failing = graph.outdistanced_sentries(&sentries, &pubkey, params.step_max);
            if !failing.is_empty() {
                return Err(ConsensusError::Outdistanced {
                    pubkey,
                    failing: failing.len(),
                });
            }
        }
        Ok(())
    }

    /// Pending transactions that survive validation; failing ones are
    /// evicted from the pool
    async fn select_transactions(&self) -> ConsensusResult<Vec<chain_core::Transaction>> {
        let dal = self.context.dal().as_ref();
        let mut selected = Vec::new();
        let mut consumed: HashSet<chain_core::TxSource> = HashSet::new();

        'candidates: for tx in dal.pending_transactions().await? {
            if let Err(err) = tx.check_structure().and_then(|_| tx.check_signatures()) {
                tracing::debug!(hash = %tx.hash(), error = %err, "pending tx evicted");
                dal.remove_pending_tx(&tx.hash()).await?;
                continue;
            }
            for input in &tx.inputs {
                let available = dal.source_amount(&input.source).await?;
                if available != Some(input.amount) || consumed.contains(&input.source) {
                    tracing::debug!(hash = %tx.hash(), "pending tx evicted: source unavailable");
                    dal.remove_pending_tx(&tx.hash()).await?;
                    continue 'candidates;
                }
            }
            for input in &tx.inputs {
                consumed.insert(input.source.clone());
            }
            selected.push(tx);
        }
        Ok(selected)
    }
}

/// Certifications usable as links for a trial newcomer set: the certifier
/// must be a member or an eligible newcomer; duplicate pairs are dropped
fn new_links(
    trial: &[PreJoin],
    members: &[Pubkey],
    eligible: &HashSet<Pubkey>,
) -> Vec<Certification> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for joiner in trial {
        for cert in &joiner.certs {
            let usable = members.contains(&cert.from) || eligible.contains(&cert.from);
            if usable && seen.insert((cert.from, cert.to)) {
                links.push(cert.clone());
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{MembershipKind, ProtocolParameters};
    use std::sync::Arc;
    use storage::MemoryDal;
    use wot_crypto::KeyPair;

    struct Fixture {
        context: ChainContext,
        dal: Arc<dyn BlockchainDao>,
    }

    fn fixture(params: ProtocolParameters) -> Fixture {
        let dal: Arc<dyn BlockchainDao> = Arc::new(MemoryDal::new());
        Fixture {
            context: ChainContext::new(dal.clone(), params),
            dal,
        }
    }

    async fn declare_candidate(dal: &dyn BlockchainDao, kp: &KeyPair, uid: &str) -> InlineIdentity {
        let identity = InlineIdentity {
            pubkey: kp.pubkey(),
            signature: kp.sign(format!("{uid}|1000|{}", kp.pubkey()).as_bytes()),
            time: 1000,
            uid: uid.into(),
        };
        dal.save_pending_identity(&identity).await.unwrap();
        let membership = Membership {
            issuer: kp.pubkey(),
            signature: Signature::empty(),
            number: 0,
            certts: 1000,
            userid: uid.into(),
            membership: MembershipKind::In,
        };
        dal.save_pending_membership(&membership).await.unwrap();
        identity
    }

    async fn certify(dal: &dyn BlockchainDao, from: &KeyPair, to: &InlineIdentity) {
        let cert = Certification {
            from: from.pubkey(),
            to: to.pubkey,
            basis: 0,
            signature: Signature::empty(),
        };
        dal.save_pending_cert(&PendingCert {
            cert,
            target_digest: to.digest(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_manual_root_assembly() {
        let params = ProtocolParameters {
            sig_qty: 2,
            ..Default::default()
        };
        let fx = fixture(params);
        let kps: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let mut identities = Vec::new();
        for (i, kp) in kps.iter().enumerate() {
            identities.push(declare_candidate(fx.dal.as_ref(), kp, &format!("user{i}")).await);
        }
        // Everyone certifies everyone else
        for (i, kp) in kps.iter().enumerate() {
            for (j, identity) in identities.iter().enumerate() {
                if i != j {
                    certify(fx.dal.as_ref(), kp, identity).await;
                }
            }
        }

        let assembler = BlockAssembler::new(fx.context.clone(), "wotcoin", 60);
        let issuer = kps[0].pubkey();
        let block = assembler
            .assemble(&ManualRootPolicy::accept_all(), issuer, 10_000)
            .await
            .unwrap();

        assert_eq!(block.number, 0);
        assert_eq!(block.members_count, 3);
        assert_eq!(block.identities.len(), 3);
        assert_eq!(block.joiners.len(), 3);
        assert_eq!(block.certifications.len(), 6);
        assert_eq!(block.median_time, 10_000 - 60);
        assert_eq!(block.pow_min, 0);
        assert_eq!(block.dividend, None);
        assert!(block.parameters.is_some());

        // The assembled root passes its own validation
        fx.context.check_block(&block, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_selection_restricts_joiners() {
        let params = ProtocolParameters {
            sig_qty: 0,
            ..Default::default()
        };
        let fx = fixture(params);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        declare_candidate(fx.dal.as_ref(), &a, "alice").await;
        declare_candidate(fx.dal.as_ref(), &b, "bob").await;

        let assembler = BlockAssembler::new(fx.context.clone(), "wotcoin", 0);
        let policy = ManualRootPolicy::new(|uids| {
            uids.iter().filter(|u| *u == "alice").cloned().collect()
        });
        let block = assembler.assemble(&policy, a.pubkey(), 5000).await.unwrap();
        assert_eq!(block.joiners.len(), 1);
        assert_eq!(block.joiners[0].userid, "alice");
    }

    async fn seed_two_member_chain(fx: &Fixture, a: &KeyPair, b: &KeyPair) {
        let mut identities = Vec::new();
        let mut joiners = Vec::new();
        for (kp, uid) in [(a, "a"), (b, "b")] {
            identities.push(InlineIdentity {
                pubkey: kp.pubkey(),
                signature: Signature::empty(),
                time: 1000,
                uid: uid.into(),
            });
            joiners.push(Membership {
                issuer: kp.pubkey(),
                signature: Signature::empty(),
                number: 0,
                certts: 1000,
                userid: uid.into(),
                membership: MembershipKind::In,
            });
        }
        let mut certifications = vec![
            Certification {
                from: a.pubkey(),
                to: b.pubkey(),
                basis: 0,
                signature: Signature::empty(),
            },
            Certification {
                from: b.pubkey(),
                to: a.pubkey(),
                basis: 0,
                signature: Signature::empty(),
            },
        ];
        certifications.sort_by_key(|c| (c.from.to_base58(), c.to.to_base58()));
        let root = Block {
            version: BLOCK_VERSION,
            currency: "wotcoin".into(),
            number: 0,
            pow_min: 0,
            time: 1000,
            median_time: 1000,
            dividend: None,
            ud_time: None,
            issuer: a.pubkey(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(fx.context.params().clone()),
            members_count: 2,
            monetary_mass: 0,
            identities,
            joiners,
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications,
            transactions: vec![],
            nonce: 0,
            signature: Signature::empty(),
        };
        fx.context.add_block(&root, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_iterated_selection_drops_outdistanced_candidate() {
        // Sentries a and b certify n1..n3 directly; n4 is certified only by
        // n1. With step_max = 1 the sentries cannot reach n4, so the first
        // pass rejects it and the recursive pass settles on {n1, n2, n3}.
        let params = ProtocolParameters {
            sig_qty: 1,
            sig_wot: 1,
            step_max: 1,
            ..Default::default()
        };
        let fx = fixture(params);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        seed_two_member_chain(&fx, &a, &b).await;

        let kps: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let mut identities = Vec::new();
        for (i, kp) in kps.iter().enumerate() {
            identities.push(declare_candidate(fx.dal.as_ref(), kp, &format!("n{}", i + 1)).await);
        }
        for identity in identities.iter().take(3) {
            certify(fx.dal.as_ref(), &a, identity).await;
            certify(fx.dal.as_ref(), &b, identity).await;
        }
        certify(fx.dal.as_ref(), &kps[0], &identities[3]).await;

        let assembler = BlockAssembler::new(fx.context.clone(), "wotcoin", 0);
        let block = assembler
            .assemble(&NextBlockPolicy, a.pubkey(), 5000)
            .await
            .unwrap();

        let joined: Vec<String> = block.joiners.iter().map(|j| j.userid.clone()).collect();
        assert_eq!(joined, vec!["n1", "n2", "n3"]);
        // Only the six member certifications made it into the block
        assert!(block.certifications.iter().all(|c| c.to != kps[3].pubkey()));
    }

    #[tokio::test]
    async fn test_invalid_pending_tx_is_evicted() {
        let params = ProtocolParameters {
            sig_qty: 0,
            ..Default::default()
        };
        let fx = fixture(params);
        let kp = KeyPair::generate();
        // Unsigned transaction: structurally broken
        let tx = chain_core::Transaction {
            issuers: vec![kp.pubkey()],
            inputs: vec![chain_core::TxInput {
                source: chain_core::TxSource::Dividend {
                    pubkey: kp.pubkey(),
                    block: 0,
                },
                amount: 10,
            }],
            outputs: vec![chain_core::TxOutput {
                pubkey: kp.pubkey(),
                amount: 10,
            }],
            comment: String::new(),
            signatures: vec![],
        };
        fx.dal.save_pending_transaction(&tx).await.unwrap();

        let assembler = BlockAssembler::new(fx.context.clone(), "wotcoin", 0);
        let block = assembler
            .assemble(&ManualRootPolicy::accept_all(), kp.pubkey(), 5000)
            .await
            .unwrap();
        assert!(block.transactions.is_empty());
        assert!(fx.dal.pending_transactions().await.unwrap().is_empty());
    }
}
