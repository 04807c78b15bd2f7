//! Claim intake and lifecycle.
//!
//! Submission is synchronous and cheap: validate the policy, take the
//! exclusivity lock, persist the claim, hand it to the worker pool. The
//! expensive part (proof generation and settlement) happens in
//! [`worker`] off the submission path.
//!
//! Idempotency: every claim carries a key, caller-supplied or derived from
//! the policy and evidence digests. Resubmitting the same key returns the
//! existing claim instead of creating a second one, except a `Failed` claim,
//! which is re-activated and processed again as the same record.

pub mod worker;

pub use worker::{ClaimProcessor, WorkerPool};

use crate::event::{ServiceEvent, ServiceEventsSender};
use crate::model::{
    Claim, ClaimEvidence, ClaimGuard, ClaimId, ClaimStatus, ClaimUpdate, PolicyGuard, PolicyId,
    PolicyUpdate, RECORD_VERSION,
};
use crate::store::{EntityStore, UpdateOutcome};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Decides whether digested evidence shows a covered failure.
///
/// The default rule covers server errors and empty responses; deployments
/// with different coverage terms swap in their own predicate.
pub type FailurePredicate = Arc<dyn Fn(&ClaimEvidence) -> bool + Send + Sync>;

/// Rule matching the standard cover terms: HTTP 5xx or an empty body.
#[must_use]
pub fn default_failure_predicate() -> FailurePredicate {
    Arc::new(|evidence| evidence.status_code >= 500 || evidence.body_len == 0)
}

/// Claim submission failure.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// No policy with that identifier.
    #[error("policy not found")]
    PolicyNotFound,

    /// The policy's coverage window has elapsed.
    #[error("policy has expired")]
    PolicyExpired,

    /// A claim against this policy has been paid, or another claim against
    /// it is still being processed.
    #[error("policy has already been claimed")]
    PolicyAlreadyClaimed,

    /// The idempotency key belongs to a claim against a different policy.
    #[error("idempotency key already used for policy {0}")]
    KeyConflict(PolicyId),

    /// The idempotency key was already used with different evidence.
    #[error("idempotency key reused with different evidence")]
    EvidenceMismatch,

    /// The worker queue is at capacity; the submission may be retried.
    #[error("claim queue is at capacity")]
    QueueFull,

    /// The worker queue has shut down.
    #[error("claim processing has shut down")]
    QueueClosed,

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] crate::Error),
}

/// Validates and enqueues claims.
///
/// The queue is bounded; a full queue rejects the submission with
/// [`ClaimError::QueueFull`] instead of buffering without limit, so overload
/// is visible to the caller.
pub struct ClaimEngine {
    store: Arc<dyn EntityStore>,
    queue: mpsc::Sender<ClaimId>,
    events: ServiceEventsSender,
}

impl ClaimEngine {
    /// Create an engine feeding `queue`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: mpsc::Sender<ClaimId>,
        events: ServiceEventsSender,
    ) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    /// Submit a claim against `policy_id` with digested `evidence`.
    ///
    /// Returns the claim record accepted for processing. For a repeated
    /// idempotency key this is the existing record; only a previously
    /// `Failed` claim is re-activated and queued again.
    ///
    /// # Errors
    ///
    /// See [`ClaimError`].
    pub fn submit(
        &self,
        policy_id: PolicyId,
        evidence: ClaimEvidence,
        idempotency_key: Option<String>,
    ) -> Result<Claim, ClaimError> {
        let key = idempotency_key
            .unwrap_or_else(|| derive_idempotency_key(policy_id, &evidence));

        if let Some(existing) = self.store.find_claim_by_idempotency_key(&key)? {
            if existing.policy_id != policy_id {
                return Err(ClaimError::KeyConflict(existing.policy_id));
            }
            if existing.evidence != evidence {
                // A reused key must carry the same payload; silently handing
                // back the old claim would mask the caller's mistake.
                return Err(ClaimError::EvidenceMismatch);
            }
            if existing.status != ClaimStatus::Failed {
                // In flight or final: the original outcome stands.
                debug!(claim_id = %existing.claim_id, status = %existing.status,
                       "idempotent resubmission, returning existing claim");
                return Ok(existing);
            }
            return self.reactivate(existing);
        }

        let policy = self
            .store
            .get_policy(policy_id)?
            .ok_or(ClaimError::PolicyNotFound)?;
        self.check_claimable(&policy)?;

        let claim = Claim {
            record_version: RECORD_VERSION,
            claim_id: Uuid::new_v4(),
            policy_id,
            idempotency_key: key,
            status: ClaimStatus::Submitted,
            evidence,
            proof: None,
            payout_units: None,
            settlement_tx_ref: None,
            reason: None,
            created_at: Utc::now(),
            finalized_at: None,
        };

        self.lock_policy(policy_id, claim.claim_id)?;
        if let Err(e) = self.store.create_claim(&claim) {
            // Undo the exclusivity lock so the policy is not stranded.
            self.unlock_policy(policy_id, claim.claim_id);
            return Err(e.into());
        }
        if let Err(e) = self.enqueue(&claim) {
            self.park_unqueued(&claim);
            return Err(e);
        }
        Ok(claim)
    }

    /// Re-queue work left over from a previous run.
    ///
    /// `Submitted` claims are enqueued as-is; claims stuck in `Verifying`
    /// (a crash mid-processing) are reset to `Submitted` first. Processing
    /// restarts from proof generation, which is safe to repeat: settlement
    /// only happens after it.
    ///
    /// A backlog larger than the queue is requeued only up to capacity; the
    /// remainder stays `Submitted` and is picked up on the next start.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the queue has shut
    /// down.
    pub fn recover(&self) -> Result<usize, ClaimError> {
        let mut recovered = 0;
        let mut left_behind = 0;
        for claim in self.store.all_claims()? {
            match claim.status {
                ClaimStatus::Submitted => {}
                ClaimStatus::Verifying => {
                    let reset = ClaimUpdate {
                        status: Some(ClaimStatus::Submitted),
                        guard: ClaimGuard {
                            status_is: Some(ClaimStatus::Verifying),
                        },
                        ..Default::default()
                    };
                    if self.store.update_claim(claim.claim_id, &reset)?
                        != UpdateOutcome::Updated
                    {
                        continue;
                    }
                }
                _ => continue,
            }
            match self.queue.try_send(claim.claim_id) {
                Ok(()) => recovered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => left_behind += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(ClaimError::QueueClosed)
                }
            }
        }
        if recovered > 0 {
            info!("Recovered {recovered} unfinished claims into the queue");
        }
        if left_behind > 0 {
            tracing::warn!(
                "{left_behind} unfinished claims exceed the queue capacity, deferred to next start"
            );
        }
        Ok(recovered)
    }

    fn reactivate(&self, claim: Claim) -> Result<Claim, ClaimError> {
        let policy = self
            .store
            .get_policy(claim.policy_id)?
            .ok_or(ClaimError::PolicyNotFound)?;
        self.check_claimable(&policy)?;
        self.lock_policy(claim.policy_id, claim.claim_id)?;

        let update = ClaimUpdate {
            status: Some(ClaimStatus::Submitted),
            reason: Some(None),
            finalized_at: Some(None),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Failed),
            },
            ..Default::default()
        };
        match self.store.update_claim(claim.claim_id, &update)? {
            UpdateOutcome::Updated => {}
            _ => {
                self.unlock_policy(claim.policy_id, claim.claim_id);
                return Err(ClaimError::PolicyAlreadyClaimed);
            }
        }
        let claim = self
            .store
            .get_claim(claim.claim_id)?
            .ok_or(ClaimError::PolicyNotFound)?;
        info!(claim_id = %claim.claim_id, "failed claim re-activated");
        if let Err(e) = self.enqueue(&claim) {
            self.park_unqueued(&claim);
            return Err(e);
        }
        Ok(claim)
    }

    fn check_claimable(&self, policy: &crate::model::Policy) -> Result<(), ClaimError> {
        use crate::model::PolicyStatus;
        match policy.status {
            PolicyStatus::Claimed => return Err(ClaimError::PolicyAlreadyClaimed),
            PolicyStatus::Expired => return Err(ClaimError::PolicyExpired),
            PolicyStatus::Active => {}
        }
        if policy.is_expired(Utc::now()) {
            return Err(ClaimError::PolicyExpired);
        }
        if policy.pending_claim.is_some() {
            return Err(ClaimError::PolicyAlreadyClaimed);
        }
        Ok(())
    }

    /// Atomically take the policy's exclusivity marker. Losing the race to a
    /// concurrent submission surfaces as [`ClaimError::PolicyAlreadyClaimed`].
    fn lock_policy(&self, policy_id: PolicyId, claim_id: ClaimId) -> Result<(), ClaimError> {
        let lock = PolicyUpdate {
            pending_claim: Some(Some(claim_id)),
            guard: PolicyGuard {
                status_is: Some(crate::model::PolicyStatus::Active),
                pending_claim_is: Some(None),
            },
            ..Default::default()
        };
        match self.store.update_policy(policy_id, &lock)? {
            UpdateOutcome::Updated => Ok(()),
            UpdateOutcome::NotFound => Err(ClaimError::PolicyNotFound),
            UpdateOutcome::Conflict => Err(ClaimError::PolicyAlreadyClaimed),
        }
    }

    fn unlock_policy(&self, policy_id: PolicyId, claim_id: ClaimId) {
        let unlock = PolicyUpdate {
            pending_claim: Some(None),
            guard: PolicyGuard {
                pending_claim_is: Some(Some(claim_id)),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Err(e) = self.store.update_policy(policy_id, &unlock) {
            tracing::error!(policy_id = %policy_id, "failed to release claim lock: {e}");
        }
    }

    fn enqueue(&self, claim: &Claim) -> Result<(), ClaimError> {
        match self.queue.try_send(claim.claim_id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(ClaimError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(ClaimError::QueueClosed),
        }
        let _ = self.events.send(ServiceEvent::ClaimSubmitted {
            claim_id: claim.claim_id,
            policy_id: claim.policy_id,
        });
        Ok(())
    }

    /// A claim that could not be handed to the workers must not stay
    /// `Submitted`, or it would block the policy until the next restart.
    /// Park it as `Failed` and release the policy; a resubmission with the
    /// same key re-activates it.
    fn park_unqueued(&self, claim: &Claim) {
        let park = ClaimUpdate {
            status: Some(ClaimStatus::Failed),
            reason: Some(Some("claim queue at capacity".to_string())),
            finalized_at: Some(Some(Utc::now())),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Submitted),
            },
            ..Default::default()
        };
        if let Err(e) = self.store.update_claim(claim.claim_id, &park) {
            tracing::error!(claim_id = %claim.claim_id, "failed to park unqueued claim: {e}");
        }
        self.unlock_policy(claim.policy_id, claim.claim_id);
    }
}

/// Deterministic idempotency key for a submission without a caller-supplied
/// one: same policy and same evidence digests always map to the same claim.
#[must_use]
pub fn derive_idempotency_key(policy_id: PolicyId, evidence: &ClaimEvidence) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy_id.as_bytes());
    hasher.update(evidence.status_code.to_le_bytes());
    hasher.update(evidence.body_len.to_le_bytes());
    hasher.update(evidence.body_hash.as_bytes());
    hasher.update(evidence.headers_hash.as_bytes());
    hex::encode(hasher.finalize())
}
