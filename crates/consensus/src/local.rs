// consensus/src/local.rs

//! Local validation: intra-block structure, independent of chain history.

use crate::{ConsensusError, ConsensusResult};
use chain_core::{Block, Membership, BLOCK_VERSION};
use std::collections::HashSet;
use wot_crypto::Pubkey;

fn valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 100
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Check everything that can be checked without a chain context
pub fn check_block_structure(block: &Block) -> ConsensusResult<()> {
    if block.version != BLOCK_VERSION {
        return Err(ConsensusError::BadStructure(format!(
            "unsupported block version {}",
            block.version
        )));
    }
    if block.currency.is_empty() {
        return Err(ConsensusError::BadStructure("empty currency".into()));
    }

    if block.is_root() {
        if block.parameters.is_none() {
            return Err(ConsensusError::BadRootBlock("missing parameters".into()));
        }
        if block.previous_hash.is_some() || block.previous_issuer.is_some() {
            return Err(ConsensusError::BadRootBlock(
                "root block cannot reference a previous block".into(),
            ));
        }
        if block.dividend.is_some() {
            return Err(ConsensusError::BadRootBlock("root block carries a dividend".into()));
        }
    } else {
        if block.parameters.is_some() {
            return Err(ConsensusError::BadStructure(
                "parameters outside the root block".into(),
            ));
        }
        if block.previous_hash.is_none() || block.previous_issuer.is_none() {
            return Err(ConsensusError::BadStructure(
                "missing previous block reference".into(),
            ));
        }
    }

    check_identities(block)?;
    check_memberships(block)?;
    check_excluded(block)?;
    check_certifications(block)?;

    for tx in &block.transactions {
        tx.check_structure()?;
    }

    Ok(())
}

fn check_identities(block: &Block) -> ConsensusResult<()> {
    let mut pubkeys = HashSet::new();
    let mut uids = HashSet::new();
    for identity in &block.identities {
        if !valid_uid(&identity.uid) {
            return Err(ConsensusError::BadStructure(format!(
                "invalid uid `{}`",
                identity.uid
            )));
        }
        if !pubkeys.insert(identity.pubkey) {
            return Err(ConsensusError::BadStructure(format!(
                "duplicate identity pubkey {}",
                identity.pubkey
            )));
        }
        if !uids.insert(identity.uid.clone()) {
            return Err(ConsensusError::BadStructure(format!(
                "duplicate identity uid `{}`",
                identity.uid
            )));
        }
        // Every written identity must join in the same block
        let joined = block.joiners.iter().any(|j| {
            j.issuer == identity.pubkey && j.userid == identity.uid && j.certts == identity.time
        });
        if !joined {
            return Err(ConsensusError::BadStructure(format!(
                "identity `{}` has no matching joiner",
                identity.uid
            )));
        }
    }
    Ok(())
}

fn check_memberships(block: &Block) -> ConsensusResult<()> {
    let mut issuers: HashSet<Pubkey> = HashSet::new();
    let all: Vec<&Membership> = block
        .joiners
        .iter()
        .chain(&block.actives)
        .chain(&block.leavers)
        .collect();
    for membership in all {
        if !valid_uid(&membership.userid) {
            return Err(ConsensusError::BadStructure(format!(
                "invalid membership uid `{}`",
                membership.userid
            )));
        }
        if !issuers.insert(membership.issuer) {
            return Err(ConsensusError::DoubleMembership(membership.issuer));
        }
    }
    Ok(())
}

fn check_excluded(block: &Block) -> ConsensusResult<()> {
    let mut seen = HashSet::new();
    for pubkey in &block.excluded {
        if !seen.insert(*pubkey) {
            return Err(ConsensusError::BadStructure(format!(
                "duplicate exclusion of {pubkey}"
            )));
        }
    }
    let mut sorted = block.excluded.clone();
    sorted.sort_by_key(|p| p.to_base58());
    if sorted != block.excluded {
        return Err(ConsensusError::BadStructure(
            "excluded entries are not ordered".into(),
        ));
    }
    Ok(())
}

fn check_certifications(block: &Block) -> ConsensusResult<()> {
    let mut seen = HashSet::new();
    for cert in &block.certifications {
        if cert.from == cert.to {
            return Err(ConsensusError::BadStructure(format!(
                "self-certification by {}",
                cert.from
            )));
        }
        if !seen.insert((cert.from, cert.to)) {
            return Err(ConsensusError::BadStructure(format!(
                "duplicate certification {} -> {}",
                cert.from, cert.to
            )));
        }
    }
    let mut sorted = block.certifications.clone();
    sorted.sort_by_key(|c| (c.from.to_base58(), c.to.to_base58()));
    if sorted != block.certifications {
        return Err(ConsensusError::BadStructure(
            "certifications are not ordered".into(),
        ));
    }
    Ok(())
}

/// Verify every embedded signature: block issuer, identities, memberships,
/// certifications and transactions
pub fn check_block_signatures(block: &Block) -> ConsensusResult<()> {
    block
        .verify_signature()
        .map_err(|_| ConsensusError::BadSignature)?;

    for identity in &block.identities {
        identity
            .pubkey
            .verify(identity.message().as_bytes(), &identity.signature)
            .map_err(|_| ConsensusError::BadSignature)?;
    }
    for membership in block
        .joiners
        .iter()
        .chain(&block.actives)
        .chain(&block.leavers)
    {
        membership
            .issuer
            .verify(membership.message().as_bytes(), &membership.signature)
            .map_err(|_| ConsensusError::BadSignature)?;
    }
    for cert in &block.certifications {
        cert.from
            .verify(cert.message().as_bytes(), &cert.signature)
            .map_err(|_| ConsensusError::BadSignature)?;
    }
    for tx in &block.transactions {
        tx.check_signatures()
            .map_err(|_| ConsensusError::BadSignature)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{
        Certification, InlineIdentity, MembershipKind, ProtocolParameters,
    };
    use wot_crypto::{Hash, KeyPair, Signature};

    fn root_block_with(kps: &[&KeyPair]) -> Block {
        let mut identities = Vec::new();
        let mut joiners = Vec::new();
        for (i, kp) in kps.iter().enumerate() {
            let uid = format!("user{i}");
            let idty = InlineIdentity {
                pubkey: kp.pubkey(),
                signature: Signature::empty(),
                time: 1_500_000_000,
                uid: uid.clone(),
            };
            identities.push(idty);
            joiners.push(Membership {
                issuer: kp.pubkey(),
                signature: Signature::empty(),
                number: 0,
                certts: 1_500_000_000,
                userid: uid,
                membership: MembershipKind::In,
            });
        }
        Block {
            version: BLOCK_VERSION,
            currency: "wotcoin".into(),
            number: 0,
            pow_min: 0,
            time: 1_500_000_000,
            median_time: 1_500_000_000,
            dividend: None,
            ud_time: None,
            issuer: kps[0].pubkey(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(ProtocolParameters::default()),
            members_count: kps.len() as u64,
            monetary_mass: 0,
            identities,
            joiners,
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![],
            transactions: vec![],
            nonce: 0,
            signature: Signature::empty(),
        }
    }

    #[test]
    fn test_valid_root_structure() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let block = root_block_with(&[&a, &b]);
        check_block_structure(&block).unwrap();
    }

    #[test]
    fn test_identity_without_joiner_rejected() {
        let a = KeyPair::generate();
        let mut block = root_block_with(&[&a]);
        block.joiners.clear();
        assert!(check_block_structure(&block).is_err());
    }

    #[test]
    fn test_double_membership_rejected() {
        let a = KeyPair::generate();
        let mut block = root_block_with(&[&a]);
        let again = block.joiners[0].clone();
        block.actives.push(again);
        assert!(matches!(
            check_block_structure(&block),
            Err(ConsensusError::DoubleMembership(_))
        ));
    }

    #[test]
    fn test_self_certification_rejected() {
        let a = KeyPair::generate();
        let mut block = root_block_with(&[&a]);
        block.certifications.push(Certification {
            from: a.pubkey(),
            to: a.pubkey(),
            basis: 0,
            signature: Signature::empty(),
        });
        assert!(check_block_structure(&block).is_err());
    }

    #[test]
    fn test_unordered_certifications_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();
        let mut block = root_block_with(&[&a, &b, &c]);
        let mut certs = vec![
            Certification {
                from: a.pubkey(),
                to: b.pubkey(),
                basis: 0,
                signature: Signature::empty(),
            },
            Certification {
                from: b.pubkey(),
                to: c.pubkey(),
                basis: 0,
                signature: Signature::empty(),
            },
        ];
        certs.sort_by_key(|c| (c.from.to_base58(), c.to.to_base58()));
        certs.reverse();
        block.certifications = certs;
        assert!(check_block_structure(&block).is_err());
    }

    #[test]
    fn test_parameters_outside_root_rejected() {
        let a = KeyPair::generate();
        let mut block = root_block_with(&[&a]);
        block.number = 1;
        block.previous_hash = Some(Hash::zero());
        block.previous_issuer = Some(a.pubkey());
        assert!(check_block_structure(&block).is_err());
    }

    #[test]
    fn test_signatures_checked() {
        let a = KeyPair::generate();
        let mut block = root_block_with(&[&a]);
        // Sign the embedded documents properly
        let message = block.identities[0].message();
        block.identities[0].signature = a.sign(message.as_bytes());
        let message = block.joiners[0].message();
        block.joiners[0].signature = a.sign(message.as_bytes());
        block.sign(&a);
        check_block_signatures(&block).unwrap();

        block.joiners[0].signature = Signature::empty();
        block.sign(&a);
        assert!(matches!(
            check_block_signatures(&block),
            Err(ConsensusError::BadSignature)
        ));
    }
}
