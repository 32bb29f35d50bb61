// node/tests/service.rs

//! End-to-end scenarios over the blockchain service.

use chain_core::{
    Block, Certification, InlineIdentity, Membership, MembershipKind, ProtocolParameters,
    BLOCK_VERSION,
};
use node::{BlockchainService, NodeConfig};
use std::sync::Arc;
use std::time::Duration;
use wot_crypto::{KeyPair, Signature};

fn test_config(window: u64, keypair: &KeyPair, params: ProtocolParameters) -> NodeConfig {
    NodeConfig {
        currency: "wotcoin".into(),
        data_dir: std::env::temp_dir()
            .join(format!("wot-node-test-{}", keypair.pubkey()))
            .to_string_lossy()
            .into_owned(),
        branches_window_size: window,
        participate: false,
        pow_delay: 0,
        cpu: 0.5,
        root_offset: 120,
        secret_key: Some(keypair.secret().to_base58()),
        params,
        logging: node::LoggingConfig {
            filter: "warn".into(),
        },
    }
}

fn identity_doc(kp: &KeyPair, uid: &str, time: u64) -> InlineIdentity {
    let mut identity = InlineIdentity {
        pubkey: kp.pubkey(),
        signature: Signature::empty(),
        time,
        uid: uid.into(),
    };
    identity.signature = kp.sign(identity.message().as_bytes());
    identity
}

fn membership_doc(kp: &KeyPair, uid: &str, certts: u64, kind: MembershipKind) -> Membership {
    let mut membership = Membership {
        issuer: kp.pubkey(),
        signature: Signature::empty(),
        number: 0,
        certts,
        userid: uid.into(),
        membership: kind,
    };
    membership.signature = kp.sign(membership.message().as_bytes());
    membership
}

fn cert_doc(from: &KeyPair, to: &InlineIdentity) -> Certification {
    let mut cert = Certification {
        from: from.pubkey(),
        to: to.pubkey,
        basis: 0,
        signature: Signature::empty(),
    };
    cert.signature = from.sign(cert.message().as_bytes());
    cert
}

/// An unchecked block used to exercise the fork tree without mining
fn bare_block(parent: Option<&Block>, issuer: &KeyPair, nonce: u64) -> Block {
    let (number, previous_hash, previous_issuer) = match parent {
        Some(p) => (p.number + 1, Some(p.hash()), Some(p.issuer)),
        None => (0, None, None),
    };
    let mut block = Block {
        version: BLOCK_VERSION,
        currency: "wotcoin".into(),
        number,
        pow_min: 0,
        time: 1_000 + number,
        median_time: 1_000 + number,
        dividend: None,
        ud_time: None,
        issuer: issuer.pubkey(),
        previous_hash,
        previous_issuer,
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
        nonce,
        signature: Signature::empty(),
    };
    block.sign(issuer);
    block
}

async fn service(window: u64, keypair: &KeyPair, params: ProtocolParameters) -> Arc<BlockchainService> {
    Arc::new(
        BlockchainService::new(test_config(window, keypair, params))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn manual_root_with_three_mutual_certifiers() {
    let operator = KeyPair::generate();
    let params = ProtocolParameters {
        sig_qty: 2,
        ..Default::default()
    };
    let service = service(0, &operator, params).await;

    let time = chain_core::now();
    let members: Vec<(KeyPair, String)> = (0..3)
        .map(|i| (KeyPair::generate(), format!("founder{i}")))
        .collect();
    let mut identities = Vec::new();
    for (kp, uid) in &members {
        let identity = identity_doc(kp, uid, time);
        service.submit_identity(&identity).await.unwrap();
        service
            .submit_membership(&membership_doc(kp, uid, time, MembershipKind::In))
            .await
            .unwrap();
        identities.push(identity);
    }
    for (i, (kp, _)) in members.iter().enumerate() {
        for (j, identity) in identities.iter().enumerate() {
            if i != j {
                service
                    .submit_certification(&cert_doc(kp, identity), &identity.digest())
                    .await
                    .unwrap();
            }
        }
    }

    let mut root = service
        .generate_manual_root(|uids| uids.to_vec())
        .await
        .unwrap();
    assert_eq!(root.number, 0);
    assert_eq!(root.members_count, 3);
    assert_eq!(root.identities.len(), 3);
    assert_eq!(root.joiners.len(), 3);
    assert_eq!(root.certifications.len(), 6);
    assert_eq!(root.pow_min, 0);
    assert_eq!(root.dividend, None);
    assert_eq!(root.time - root.median_time, 120);
    assert!(root.parameters.is_some());

    // The signed root passes full validation and lands on the chain
    root.sign(&operator);
    let outcome = service.submit_block(&root, true).await.unwrap();
    assert!(outcome.extended_main);
    assert_eq!(service.current().await.unwrap().unwrap().number, 0);

    // Submitting it again is a no-op with a structured error
    let err = service.submit_block(&root, true).await.unwrap_err();
    assert!(matches!(
        err,
        node::ServiceError::Consensus(consensus::ConsensusError::AlreadyKnown)
    ));

    // The raw wire form round-trips bit-identically
    let raw = root.signed_raw();
    let parsed = Block::parse_raw(&raw).unwrap();
    assert_eq!(parsed.signed_raw(), raw);
    assert_eq!(parsed.hash(), root.hash());
}

#[tokio::test]
async fn window_zero_extends_the_chain_linearly() {
    let operator = KeyPair::generate();
    let params = ProtocolParameters {
        sig_qty: 0,
        ..Default::default()
    };
    let service = service(0, &operator, params).await;

    let mut root = service
        .generate_manual_root(|uids| uids.to_vec())
        .await
        .unwrap();
    root.sign(&operator);
    service.submit_block(&root, true).await.unwrap();

    let mut next = service.generate_empty_next().await.unwrap();
    next.sign(&operator);
    let outcome = service.submit_block(&next, true).await.unwrap();

    assert!(outcome.extended_main);
    assert!(service.branches().await.unwrap().is_empty());
    let current = service.current().await.unwrap().unwrap();
    assert_eq!(current.number, 1);
    assert_eq!(current.previous_hash, Some(root.hash()));

    // Statistics see the confirmed chain
    service.compute_stats().await.unwrap();
    let stat = service.stat("ud").await.unwrap().unwrap();
    assert_eq!(stat.last_parsed_block, Some(1));
}

#[tokio::test]
async fn window_three_fork_promotes_and_orphans() {
    let kp = KeyPair::generate();
    let service = service(3, &kp, ProtocolParameters::default()).await;

    let root_a = bare_block(None, &kp, 1);
    let root_b = bare_block(None, &kp, 2);
    service.submit_block(&root_a, false).await.unwrap();
    service.submit_block(&root_b, false).await.unwrap();

    let a1 = bare_block(Some(&root_a), &kp, 1);
    let a2 = bare_block(Some(&a1), &kp, 1);
    let a3 = bare_block(Some(&a2), &kp, 1);
    service.submit_block(&a1, false).await.unwrap();
    service.submit_block(&a2, false).await.unwrap();
    let outcome = service.submit_block(&a3, false).await.unwrap();

    // Branch size 4 > W=3: the branch root is promoted, the rival dies
    assert_eq!(outcome.promoted, vec![0]);
    assert_eq!(service.promoted(0).await.unwrap().hash(), root_a.hash());

    let branches = service.branches().await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].hash(), a3.hash());

    // The working view follows the surviving branch
    assert_eq!(service.current().await.unwrap().unwrap().hash(), a3.hash());
}

#[tokio::test]
async fn main_fork_election_prefers_highest_hash() {
    let kp = KeyPair::generate();
    let service = service(5, &kp, ProtocolParameters::default()).await;

    let root = bare_block(None, &kp, 1);
    service.submit_block(&root, false).await.unwrap();

    let x = bare_block(Some(&root), &kp, 10);
    let y = bare_block(Some(&root), &kp, 20);
    service.submit_block(&x, false).await.unwrap();
    service.submit_block(&y, false).await.unwrap();

    let expected = x.hash().max(y.hash());
    let current = service.current().await.unwrap().unwrap();
    assert_eq!(current.hash(), expected);
    assert_eq!(service.branches().await.unwrap().len(), 2);
}

#[tokio::test]
async fn proof_is_cancelled_by_incoming_block() {
    let kp = KeyPair::generate();
    let service = service(0, &kp, ProtocolParameters::default()).await;

    let root = bare_block(None, &kp, 1);
    service.submit_block(&root, false).await.unwrap();

    // Prove at an impossible difficulty so only cancellation can end it
    let candidate = bare_block(Some(&root), &kp, 0);
    let prover = service.clone();
    let proof = tokio::spawn(async move { prover.prove(candidate, 64).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let external = bare_block(Some(&root), &kp, 777);
    service.submit_block(&external, false).await.unwrap();

    let outcome = proof.await.unwrap().unwrap();
    assert!(outcome.is_none());
    assert_eq!(
        service.current().await.unwrap().unwrap().hash(),
        external.hash()
    );
    assert_eq!(service.pow_stats().proofs_cancelled, 1);
}

#[tokio::test]
async fn identity_requirements_report_missing_certifications() {
    let operator = KeyPair::generate();
    let params = ProtocolParameters {
        sig_qty: 2,
        ..Default::default()
    };
    let service = service(0, &operator, params).await;

    let kp = KeyPair::generate();
    let identity = identity_doc(&kp, "newbie", chain_core::now());
    service.submit_identity(&identity).await.unwrap();
    service
        .submit_membership(&membership_doc(
            &kp,
            "newbie",
            chain_core::now(),
            MembershipKind::In,
        ))
        .await
        .unwrap();

    let requirements = service.requirements_of_identity(&identity).await.unwrap();
    assert_eq!(requirements.valid_certifications, 0);
    assert_eq!(requirements.required_certifications, 2);
    assert!(requirements.membership_pending);
    assert!(!requirements.uid_taken);
}
