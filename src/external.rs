//! External integrations: the failure prover and the settlement ledger.
//!
//! Both are traits so claim processing can be driven end-to-end in tests
//! with the in-memory mocks below. Calls may block on the network; nothing
//! in the claim pipeline holds a store lock across them.

use crate::model::{ClaimEvidence, ProofRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Prover failure.
#[derive(Debug, Error)]
pub enum ProverError {
    /// The prover could not be reached or timed out.
    #[error("prover unavailable: {0}")]
    Unavailable(String),
    /// The prover refused the evidence.
    #[error("prover rejected evidence: {0}")]
    Rejected(String),
}

/// Settlement ledger failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The reserve account cannot cover the transfer.
    #[error("insufficient reserve funds: have {available}, need {required}")]
    InsufficientFunds {
        /// Available balance in micro-units.
        available: u64,
        /// Requested transfer in micro-units.
        required: u64,
    },
    /// The ledger could not be reached.
    #[error("ledger network error: {0}")]
    Network(String),
}

/// Produces and checks proofs that a response constitutes a covered failure.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Generate a proof over digested evidence.
    ///
    /// # Errors
    ///
    /// Returns a [`ProverError`] if the proof cannot be produced.
    async fn generate_proof(&self, evidence: &ClaimEvidence) -> Result<ProofRecord, ProverError>;

    /// Check a proof's internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a [`ProverError`] if the proof cannot be checked.
    async fn verify_proof(&self, proof: &ProofRecord) -> Result<bool, ProverError>;
}

/// Moves reserve funds to claimants.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current reserve balance in micro-units.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger cannot be reached.
    async fn balance(&self) -> Result<u64, LedgerError>;

    /// Transfer `amount_units` to `recipient`; returns the transaction
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the transfer fails; a failed transfer
    /// moves no funds.
    async fn transfer(&self, recipient: &str, amount_units: u64) -> Result<String, LedgerError>;
}

/// Index of the failure flag in [`ProofRecord::public_inputs`].
pub const PROOF_INPUT_IS_FAILURE: usize = 0;
/// Index of the status code in [`ProofRecord::public_inputs`].
pub const PROOF_INPUT_STATUS: usize = 1;
/// Index of the body length in [`ProofRecord::public_inputs`].
pub const PROOF_INPUT_BODY_LEN: usize = 2;
/// Index of the suggested payout in [`ProofRecord::public_inputs`].
pub const PROOF_INPUT_SUGGESTED_PAYOUT: usize = 3;

/// In-process prover with configurable latency and failure injection.
pub struct MockProver {
    latency: Duration,
    fail_next: AtomicBool,
}

impl Default for MockProver {
    fn default() -> Self {
        Self::new(Duration::from_millis(0))
    }
}

impl MockProver {
    /// Prover that takes `latency` per proof.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next `generate_proof` call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Prover for MockProver {
    async fn generate_proof(&self, evidence: &ClaimEvidence) -> Result<ProofRecord, ProverError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProverError::Unavailable("injected failure".to_string()));
        }

        let start = std::time::Instant::now();
        let is_failure = u64::from(evidence.status_code >= 500 || evidence.body_len == 0);
        let mut hasher = Sha256::new();
        hasher.update(evidence.body_hash.as_bytes());
        hasher.update(evidence.headers_hash.as_bytes());
        hasher.update(evidence.status_code.to_le_bytes());
        Ok(ProofRecord {
            blob: hex::encode(hasher.finalize()),
            public_inputs: vec![
                is_failure,
                u64::from(evidence.status_code),
                evidence.body_len,
                0,
            ],
            generation_time_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn verify_proof(&self, proof: &ProofRecord) -> Result<bool, ProverError> {
        Ok(proof.public_inputs.len() == 4 && !proof.blob.is_empty())
    }
}

/// In-memory ledger with a mutable balance and a transfer log.
pub struct MockLedger {
    balance: Mutex<u64>,
    transfers: Mutex<Vec<(String, u64)>>,
    next_tx: AtomicU64,
    fail_next: AtomicBool,
}

impl MockLedger {
    /// Ledger starting with `balance_units` in reserve.
    #[must_use]
    pub fn new(balance_units: u64) -> Self {
        Self {
            balance: Mutex::new(balance_units),
            transfers: Mutex::new(Vec::new()),
            next_tx: AtomicU64::new(1),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next `transfer` call fail with a network error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Transfers executed so far, as `(recipient, amount)` pairs.
    #[must_use]
    pub fn transfers(&self) -> Vec<(String, u64)> {
        self.transfers.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn balance(&self) -> Result<u64, LedgerError> {
        Ok(*self.balance.lock())
    }

    async fn transfer(&self, recipient: &str, amount_units: u64) -> Result<String, LedgerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Network("injected failure".to_string()));
        }
        let mut balance = self.balance.lock();
        if *balance < amount_units {
            return Err(LedgerError::InsufficientFunds {
                available: *balance,
                required: amount_units,
            });
        }
        *balance -= amount_units;
        self.transfers
            .lock()
            .push((recipient.to_string(), amount_units));
        let seq = self.next_tx.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock-tx-{seq:08x}"))
    }
}
