//! Background claim processing.
//!
//! Workers pull claim ids off a shared queue and drive each claim from
//! `Submitted` to a terminal state: prove the failure, check it against the
//! cover terms, settle the payout, release the policy. Store locks are never
//! held across the prover or ledger calls; every transition is a guarded
//! update, so a stale queue entry or a concurrent worker loses the guard and
//! backs off instead of double-processing.

use crate::claim::FailurePredicate;
use crate::event::{ServiceEvent, ServiceEventsSender};
use crate::external::{
    LedgerClient, Prover, PROOF_INPUT_IS_FAILURE, PROOF_INPUT_SUGGESTED_PAYOUT,
};
use crate::model::{
    Claim, ClaimGuard, ClaimId, ClaimStatus, ClaimUpdate, Policy, PolicyGuard, PolicyStatus,
    PolicyUpdate,
};
use crate::store::{EntityStore, UpdateOutcome};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const UPDATE_ATTEMPTS: usize = 3;

/// Processes one claim at a time against the store, prover and ledger.
pub struct ClaimProcessor {
    store: Arc<dyn EntityStore>,
    prover: Arc<dyn Prover>,
    ledger: Arc<dyn LedgerClient>,
    covered: FailurePredicate,
    events: ServiceEventsSender,
}

impl ClaimProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        prover: Arc<dyn Prover>,
        ledger: Arc<dyn LedgerClient>,
        covered: FailurePredicate,
        events: ServiceEventsSender,
    ) -> Self {
        Self {
            store,
            prover,
            ledger,
            covered,
            events,
        }
    }

    /// Drive `claim_id` to a terminal state.
    pub async fn process(&self, claim_id: ClaimId) {
        let claim = match self.store.get_claim(claim_id) {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                warn!(claim_id = %claim_id, "queued claim no longer exists");
                return;
            }
            Err(e) => {
                error!(claim_id = %claim_id, "failed to load queued claim: {e}");
                return;
            }
        };
        if claim.status != ClaimStatus::Submitted {
            debug!(claim_id = %claim_id, status = %claim.status, "skipping stale queue entry");
            return;
        }

        // Take ownership of the claim; a second worker holding the same
        // queue entry loses this guard and backs off.
        let take = ClaimUpdate {
            status: Some(ClaimStatus::Verifying),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Submitted),
            },
            ..Default::default()
        };
        match self.store.update_claim(claim_id, &take) {
            Ok(UpdateOutcome::Updated) => {}
            Ok(_) => {
                debug!(claim_id = %claim_id, "claim taken by another worker");
                return;
            }
            Err(e) => {
                error!(claim_id = %claim_id, "failed to take claim: {e}");
                return;
            }
        }

        let policy = match self.store.get_policy(claim.policy_id) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                self.finish_failed(&claim, "policy record missing").await;
                return;
            }
            Err(e) => {
                self.finish_failed(&claim, &format!("store: {e}")).await;
                return;
            }
        };

        self.run(claim, policy).await;
    }

    async fn run(&self, claim: Claim, policy: Policy) {
        let proof = match self.prover.generate_proof(&claim.evidence).await {
            Ok(proof) => proof,
            Err(e) => {
                self.finish_failed(&claim, &format!("prover: {e}")).await;
                return;
            }
        };
        match self.prover.verify_proof(&proof).await {
            Ok(true) => {}
            Ok(false) => {
                self.finish_failed(&claim, "proof did not verify").await;
                return;
            }
            Err(e) => {
                self.finish_failed(&claim, &format!("prover: {e}")).await;
                return;
            }
        }

        let proven_failure = proof
            .public_inputs
            .get(PROOF_INPUT_IS_FAILURE)
            .copied()
            .unwrap_or(0)
            == 1;
        if !proven_failure || !(self.covered)(&claim.evidence) {
            self.finish_rejected(&claim, &policy, "evidence does not show a covered failure")
                .await;
            return;
        }

        // Payout defaults to full coverage; a nonzero prover suggestion can
        // only lower it.
        let suggested = proof
            .public_inputs
            .get(PROOF_INPUT_SUGGESTED_PAYOUT)
            .copied()
            .unwrap_or(0);
        let payout = if suggested > 0 {
            policy.coverage_units.min(suggested)
        } else {
            policy.coverage_units
        };

        let tx_ref = match self.ledger.transfer(&policy.owner_identity, payout).await {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                self.finish_failed(&claim, &format!("ledger: {e}")).await;
                return;
            }
        };

        // Funds have moved; everything after this must converge on Paid.
        let paid = ClaimUpdate {
            status: Some(ClaimStatus::Paid),
            proof: Some(proof),
            payout_units: Some(payout),
            settlement_tx_ref: Some(tx_ref.clone()),
            reason: Some(Some("payout issued".to_string())),
            finalized_at: Some(Some(Utc::now())),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Verifying),
            },
            ..Default::default()
        };
        self.update_claim_persistent(claim.claim_id, &paid);

        let close = PolicyUpdate {
            status: Some(PolicyStatus::Claimed),
            pending_claim: Some(None),
            guard: PolicyGuard {
                pending_claim_is: Some(Some(claim.claim_id)),
                ..Default::default()
            },
            ..Default::default()
        };
        self.update_policy_persistent(policy.policy_id, &close);

        info!(
            claim_id = %claim.claim_id,
            policy_id = %policy.policy_id,
            payout_units = payout,
            tx_ref = %tx_ref,
            "claim paid"
        );
        let _ = self.events.send(ServiceEvent::ClaimPaid {
            claim_id: claim.claim_id,
            payout_units: payout,
            tx_ref,
        });
    }

    /// Terminal `Rejected`: the evidence was judged and found not covered.
    /// The policy goes back to claimable.
    async fn finish_rejected(&self, claim: &Claim, policy: &Policy, reason: &str) {
        let update = ClaimUpdate {
            status: Some(ClaimStatus::Rejected),
            reason: Some(Some(reason.to_string())),
            finalized_at: Some(Some(Utc::now())),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Verifying),
            },
            ..Default::default()
        };
        self.update_claim_persistent(claim.claim_id, &update);
        self.release_policy(policy.policy_id, claim.claim_id);

        info!(claim_id = %claim.claim_id, reason, "claim rejected");
        let _ = self.events.send(ServiceEvent::ClaimRejected {
            claim_id: claim.claim_id,
            reason: reason.to_string(),
        });
    }

    /// Terminal `Failed`: a downstream dependency broke, the claim was never
    /// judged. A resubmission with the same key will try again.
    ///
    /// No funds moved, so the policy's exclusivity marker is always released,
    /// even when the policy record itself could not be read. The guarded
    /// release is a no-op if the marker no longer points at this claim.
    async fn finish_failed(&self, claim: &Claim, reason: &str) {
        let update = ClaimUpdate {
            status: Some(ClaimStatus::Failed),
            reason: Some(Some(reason.to_string())),
            finalized_at: Some(Some(Utc::now())),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Verifying),
            },
            ..Default::default()
        };
        self.update_claim_persistent(claim.claim_id, &update);
        self.release_policy(claim.policy_id, claim.claim_id);

        warn!(claim_id = %claim.claim_id, reason, "claim failed");
        let _ = self.events.send(ServiceEvent::ClaimFailed {
            claim_id: claim.claim_id,
            reason: reason.to_string(),
        });
    }

    fn release_policy(&self, policy_id: crate::model::PolicyId, claim_id: ClaimId) {
        let unlock = PolicyUpdate {
            pending_claim: Some(None),
            guard: PolicyGuard {
                pending_claim_is: Some(Some(claim_id)),
                ..Default::default()
            },
            ..Default::default()
        };
        self.update_policy_persistent(policy_id, &unlock);
    }

    fn update_claim_persistent(&self, claim_id: ClaimId, update: &ClaimUpdate) {
        for attempt in 1..=UPDATE_ATTEMPTS {
            match self.store.update_claim(claim_id, update) {
                Ok(UpdateOutcome::Updated) => return,
                Ok(outcome) => {
                    error!(claim_id = %claim_id, ?outcome, "claim transition lost its guard");
                    return;
                }
                Err(e) if attempt < UPDATE_ATTEMPTS => {
                    warn!(claim_id = %claim_id, attempt, "claim update failed, retrying: {e}");
                }
                Err(e) => {
                    error!(claim_id = %claim_id, "claim update failed permanently: {e}");
                    let _ = self.events.send(ServiceEvent::Error {
                        message: format!("claim {claim_id} update failed: {e}"),
                    });
                }
            }
        }
    }

    fn update_policy_persistent(&self, policy_id: crate::model::PolicyId, update: &PolicyUpdate) {
        for attempt in 1..=UPDATE_ATTEMPTS {
            match self.store.update_policy(policy_id, update) {
                Ok(UpdateOutcome::Updated) => return,
                Ok(outcome) => {
                    error!(policy_id = %policy_id, ?outcome, "policy transition lost its guard");
                    return;
                }
                Err(e) if attempt < UPDATE_ATTEMPTS => {
                    warn!(policy_id = %policy_id, attempt, "policy update failed, retrying: {e}");
                }
                Err(e) => {
                    error!(policy_id = %policy_id, "policy update failed permanently: {e}");
                    let _ = self.events.send(ServiceEvent::Error {
                        message: format!("policy {policy_id} update failed: {e}"),
                    });
                }
            }
        }
    }
}

/// Pool of claim-processing workers sharing one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining `queue` through `processor`.
    #[must_use]
    pub fn spawn(
        processor: Arc<ClaimProcessor>,
        workers: usize,
        queue: mpsc::Receiver<ClaimId>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..workers)
            .map(|worker| {
                let processor = Arc::clone(&processor);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    debug!(worker, "claim worker started");
                    loop {
                        // Hold the queue lock only while receiving, so other
                        // workers can pull while this one processes.
                        let next = { queue.lock().await.recv().await };
                        match next {
                            Some(claim_id) => processor.process(claim_id).await,
                            None => break,
                        }
                    }
                    debug!(worker, "claim worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for all workers to drain and exit. Returns once every sender for
    /// the queue has been dropped and the queue is empty.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("claim worker panicked: {e}");
                }
            }
        }
    }

    /// Abort all workers immediately.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
