// pow/src/coordinator.rs

//! Single-miner coordination: serialized proofs, cooperative cancellation
//! on block arrival, worker memory recycling.

use crate::{
    worker::{ProofRequest, Worker, WorkerEvent, RELEASE_MEMORY_THRESHOLD},
    PowError, PowResult,
};
use chain_core::Block;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

/// Where the miner currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProverState {
    /// No mining in progress
    Idle,
    /// Delayed start after a self-issued block; cancellable
    Waiting,
    /// Worker running
    Proving,
    /// Cancellation requested, waiting for the next progress tick
    Cancelling,
}

/// Miner health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PowStats {
    pub state: ProverState,
    pub last_nonce: u64,
    pub tests_per_second: u64,
    pub proofs_found: u64,
    pub proofs_cancelled: u64,
}

#[derive(Debug)]
struct Shared {
    state: ProverState,
    cancel_requested: bool,
    confirmations: Vec<oneshot::Sender<()>>,
    last_nonce: u64,
    tests_per_second: u64,
    proofs_found: u64,
    proofs_cancelled: u64,
}

impl Shared {
    fn confirm_all(&mut self) {
        for confirmation in self.confirmations.drain(..) {
            let _ = confirmation.send(());
        }
        self.cancel_requested = false;
    }
}

/// Owns at most one worker and serializes every proof request
pub struct PowCoordinator {
    fifo: Mutex<()>,
    shared: Arc<StdMutex<Shared>>,
    wakeup: Arc<Notify>,
}

impl Default for PowCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PowCoordinator {
    pub fn new() -> Self {
        Self {
            fifo: Mutex::new(()),
            shared: Arc::new(StdMutex::new(Shared {
                state: ProverState::Idle,
                cancel_requested: false,
                confirmations: Vec::new(),
                last_nonce: 0,
                tests_per_second: 0,
                proofs_found: 0,
                proofs_cancelled: 0,
            })),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn stats(&self) -> PowStats {
        let shared = self.shared.lock().expect("pow state lock");
        PowStats {
            state: shared.state,
            last_nonce: shared.last_nonce,
            tests_per_second: shared.tests_per_second,
            proofs_found: shared.proofs_found,
            proofs_cancelled: shared.proofs_cancelled,
        }
    }

    /// A new block arrived: cancel any proof or delayed start in flight.
    ///
    /// The returned receiver resolves once the cancellation took effect;
    /// it resolves immediately when nothing is running.
    pub fn request_cancel(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut shared = self.shared.lock().expect("pow state lock");
        match shared.state {
            ProverState::Idle => {
                let _ = tx.send(());
            }
            ProverState::Proving | ProverState::Cancelling | ProverState::Waiting => {
                if shared.state == ProverState::Proving {
                    shared.state = ProverState::Cancelling;
                }
                shared.cancel_requested = true;
                shared.confirmations.push(tx);
                self.wakeup.notify_waiters();
            }
        }
        rx
    }

    /// Cancellable delay before a proof (the post-self-issuance hold-off).
    /// Returns true when the full delay elapsed, false when broken by a
    /// block arrival.
    pub async fn wait_before_proof(&self, delay: Duration) -> bool {
        {
            let mut shared = self.shared.lock().expect("pow state lock");
            shared.state = ProverState::Waiting;
        }
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.wakeup.notified() => false,
        };
        let mut shared = self.shared.lock().expect("pow state lock");
        shared.state = ProverState::Idle;
        if !outcome {
            shared.confirm_all();
        }
        outcome
    }

    /// Run the worker until it proves the block or the proof is cancelled.
    ///
    /// Cancellation is honored on the first progress tick after the speed
    /// calibration; `None` means cancelled. The worker is respawned when
    /// its nonce advances past `RELEASE_MEMORY_THRESHOLD` so its memory is
    /// reclaimed; callers never observe that.
    pub async fn prove(&self, request: ProofRequest) -> PowResult<Option<Block>> {
        let Ok(_guard) = self.fifo.try_lock() else {
            return Err(PowError::AlreadyProving);
        };
        {
            let mut shared = self.shared.lock().expect("pow state lock");
            shared.state = ProverState::Proving;
            shared.cancel_requested = false;
        }
        tracing::info!(
            number = request.block.number,
            zeros = request.zeros,
            "proof started"
        );

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut worker = Worker::spawn(request.clone(), 0, events_tx.clone())?;
        let mut spawn_nonce = 0u64;
        let mut calibrated = false;

        loop {
            match events.recv().await {
                Some(WorkerEvent::Calibrated {
                    tests_per_round,
                    tests_per_second,
                }) => {
                    calibrated = true;
                    let mut shared = self.shared.lock().expect("pow state lock");
                    shared.tests_per_second = tests_per_second;
                    tracing::debug!(tests_per_round, tests_per_second, "worker calibrated");
                }
                Some(WorkerEvent::Progress { nonce }) => {
                    let cancelled = {
                        let mut shared = self.shared.lock().expect("pow state lock");
                        shared.last_nonce = nonce;
                        shared.cancel_requested && calibrated
                    };
                    if cancelled {
                        worker.kill();
                        let mut shared = self.shared.lock().expect("pow state lock");
                        shared.state = ProverState::Idle;
                        shared.proofs_cancelled += 1;
                        shared.confirm_all();
                        tracing::info!(nonce, "proof cancelled");
                        return Ok(None);
                    }
                    if nonce.saturating_sub(spawn_nonce) > RELEASE_MEMORY_THRESHOLD {
                        worker.kill();
                        spawn_nonce = nonce;
                        worker = Worker::spawn(request.clone(), nonce, events_tx.clone())?;
                        tracing::debug!(nonce, "worker recycled");
                    }
                }
                Some(WorkerEvent::Found { block, tests_count }) => {
                    let mut shared = self.shared.lock().expect("pow state lock");
                    shared.state = ProverState::Idle;
                    shared.proofs_found += 1;
                    shared.confirm_all();
                    tracing::info!(
                        number = block.number,
                        nonce = block.nonce,
                        tests_count,
                        "proof found"
                    );
                    return Ok(Some(block));
                }
                None => {
                    let mut shared = self.shared.lock().expect("pow state lock");
                    shared.state = ProverState::Idle;
                    shared.confirm_all();
                    return Err(PowError::WorkerDied);
                }
            }
        }
    }

    /// Teardown request: cancel when proving, no-op when idle. Resolves
    /// once the miner actually stands down.
    pub async fn stop_proof(&self) {
        let receiver = self.request_cancel();
        let _ = receiver.await;
    }
}
