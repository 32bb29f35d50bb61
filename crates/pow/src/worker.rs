// pow/src/worker.rs

//! The miner worker: an OS thread grinding nonces over a signed block.

use crate::PowResult;
use chain_core::Block;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use wot_crypto::KeyPair;

/// Nonce span after which the worker is respawned so its heap resets
pub const RELEASE_MEMORY_THRESHOLD: u64 = 10_000_000;

/// Hashes used to measure the raw rate before the first round
const CALIBRATION_TESTS: u64 = 64;

/// Wall-clock size of one scheduling round at full throttle
const ROUND_SECONDS: f64 = 0.25;

/// Everything the worker needs to mine: the wire contract of the miner
#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub block: Block,
    pub zeros: u32,
    /// Signing key, base58-encoded for transport
    pub secret_b58: String,
    /// Share of one CPU the worker may consume, in (0, 1]
    pub cpu: f64,
}

/// Messages from the worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Initial speed calibration
    Calibrated {
        tests_per_round: u64,
        tests_per_second: u64,
    },
    /// End-of-round heartbeat
    Progress { nonce: u64 },
    /// Proof found; the block is signed with the final nonce
    Found { block: Block, tests_count: u64 },
}

/// Handle over one mining thread
pub struct Worker {
    stop: Arc<AtomicBool>,
}

impl Worker {
    /// Start mining `request` at `start_nonce`, reporting over `events`
    pub fn spawn(
        request: ProofRequest,
        start_nonce: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> PowResult<Self> {
        let keypair = KeyPair::from_base58_secret(&request.secret_b58)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        std::thread::spawn(move || {
            mine(request, keypair, start_nonce, events, stop_flag);
        });

        Ok(Self { stop })
    }

    /// Ask the thread to exit at its next round boundary
    pub fn kill(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}

fn mine(
    request: ProofRequest,
    keypair: KeyPair,
    start_nonce: u64,
    events: UnboundedSender<WorkerEvent>,
    stop: Arc<AtomicBool>,
) {
    let cpu = request.cpu.clamp(0.01, 1.0);
    let mut block = request.block;
    let mut nonce = start_nonce;
    let mut tests_count = 0u64;

    let try_nonce = |block: &mut Block, nonce: u64| {
        block.nonce = nonce;
        block.sign(&keypair);
        block.hash().leading_zero_nibbles() >= request.zeros
    };

    // Calibration round: measure the raw rate, size the rounds to honor
    // the cpu share
    let started = Instant::now();
    for _ in 0..CALIBRATION_TESTS {
        tests_count += 1;
        if try_nonce(&mut block, nonce) {
            let _ = events.send(WorkerEvent::Calibrated {
                tests_per_round: CALIBRATION_TESTS,
                tests_per_second: CALIBRATION_TESTS,
            });
            let _ = events.send(WorkerEvent::Found { block, tests_count });
            return;
        }
        nonce += 1;
    }
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    let tests_per_second = (CALIBRATION_TESTS as f64 / elapsed).max(1.0);
    let tests_per_round = ((tests_per_second * cpu * ROUND_SECONDS) as u64).max(1);
    let _ = events.send(WorkerEvent::Calibrated {
        tests_per_round,
        tests_per_second: tests_per_second as u64,
    });

    loop {
        if stop.load(Ordering::Relaxed) {
            tracing::debug!(nonce, "worker stopped");
            return;
        }
        let round_started = Instant::now();
        for _ in 0..tests_per_round {
            tests_count += 1;
            if try_nonce(&mut block, nonce) {
                let _ = events.send(WorkerEvent::Found { block, tests_count });
                return;
            }
            nonce += 1;
        }
        if events.send(WorkerEvent::Progress { nonce }).is_err() {
            // Nobody is listening anymore
            return;
        }
        // Self-throttle: pad the round so observed rate ~= cpu * raw rate
        if cpu < 1.0 {
            let busy = round_started.elapsed().as_secs_f64();
            let idle = busy * (1.0 - cpu) / cpu;
            std::thread::sleep(Duration::from_secs_f64(idle.min(2.0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{ProtocolParameters, BLOCK_VERSION};
    use tokio::sync::mpsc;
    use wot_crypto::Signature;

    fn request(zeros: u32) -> ProofRequest {
        let keypair = KeyPair::generate();
        let block = Block {
            version: BLOCK_VERSION,
            currency: "wotcoin".into(),
            number: 0,
            pow_min: zeros,
            time: 1000,
            median_time: 1000,
            dividend: None,
            ud_time: None,
            issuer: keypair.pubkey(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(ProtocolParameters::default()),
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
        };
        ProofRequest {
            block,
            zeros,
            secret_b58: keypair.secret().to_base58(),
            cpu: 1.0,
        }
    }

    #[tokio::test]
    async fn test_worker_finds_trivial_proof() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = Worker::spawn(request(0), 0, tx).unwrap();

        loop {
            match rx.recv().await.expect("worker events") {
                WorkerEvent::Found { block, tests_count } => {
                    assert!(tests_count >= 1);
                    block.verify_signature().unwrap();
                    break;
                }
                WorkerEvent::Calibrated { .. } | WorkerEvent::Progress { .. } => {}
            }
        }
    }

    #[tokio::test]
    async fn test_worker_honors_difficulty() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = Worker::spawn(request(1), 0, tx).unwrap();

        loop {
            match rx.recv().await.expect("worker events") {
                WorkerEvent::Found { block, .. } => {
                    assert!(block.hash().leading_zero_nibbles() >= 1);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_worker_stops_on_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // 64 zero nibbles will never be found
        let worker = Worker::spawn(request(64), 0, tx).unwrap();

        // Wait for calibration, then kill; the channel must close
        loop {
            match rx.recv().await.expect("worker events") {
                WorkerEvent::Calibrated { .. } => break,
                _ => {}
            }
        }
        worker.kill();
        loop {
            match rx.recv().await {
                None => break,
                Some(WorkerEvent::Found { .. }) => panic!("impossible proof"),
                Some(_) => {}
            }
        }
    }
}
