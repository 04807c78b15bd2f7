//! Entity model: policies, claims and their typed update payloads.
//!
//! Update structs are the wire contract between the managers and the entity
//! store: a field that is not present on the struct cannot be mutated, which
//! makes the type itself the allow-list required by the store contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque policy identifier.
pub type PolicyId = Uuid;

/// Opaque claim identifier.
pub type ClaimId = Uuid;

/// Current persisted record format version.
pub const RECORD_VERSION: u32 = 1;

const fn current_record_version() -> u32 {
    RECORD_VERSION
}

/// Policy lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    /// Coverage is in force.
    Active,
    /// A claim against this policy has been paid.
    Claimed,
    /// The coverage window has elapsed.
    Expired,
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyStatus::Active => write!(f, "active"),
            PolicyStatus::Claimed => write!(f, "claimed"),
            PolicyStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A time-bounded coverage grant created after a verified payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Persisted record format version.
    #[serde(default = "current_record_version")]
    pub record_version: u32,
    /// Unique policy identifier.
    pub policy_id: PolicyId,
    /// Authenticated payer identity (hex-encoded public key).
    pub owner_identity: String,
    /// SHA-256 of the protected endpoint. The raw value is never stored.
    pub target_hash: String,
    /// Coverage amount in micro-units.
    pub coverage_units: u64,
    /// Premium paid in micro-units.
    pub premium_units: u64,
    /// Lifecycle status.
    pub status: PolicyStatus,
    /// Eligibility marker: the claim currently holding exclusivity, if any.
    ///
    /// While set, any further claim submission for this policy is rejected.
    #[serde(default)]
    pub pending_claim: Option<ClaimId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time (`created_at` + fixed duration).
    pub expires_at: DateTime<Utc>,
    /// Number of times the policy has been renewed.
    #[serde(default)]
    pub renewal_count: u32,
    /// Total renewal fees paid, in micro-units.
    #[serde(default)]
    pub total_renewal_fee_units: u64,
}

impl Policy {
    /// Whether the coverage window has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the policy is claimable at `now`: active, unexpired, and not
    /// already locked by an in-flight claim.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == PolicyStatus::Active && !self.is_expired(now) && self.pending_claim.is_none()
    }
}

/// Claim lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Validated and queued for processing.
    Submitted,
    /// Proof generation / settlement in progress.
    Verifying,
    /// Payout issued.
    Paid,
    /// Evidence did not show a covered failure.
    Rejected,
    /// Processing failed downstream; may be retried with the same key.
    Failed,
}

impl ClaimStatus {
    /// Terminal states: no background work remains.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClaimStatus::Paid | ClaimStatus::Rejected | ClaimStatus::Failed
        )
    }

    /// Final states: the record will never change again. `Failed` is terminal
    /// but may be re-activated by a fresh submission with the same key.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, ClaimStatus::Paid | ClaimStatus::Rejected)
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimStatus::Submitted => write!(f, "submitted"),
            ClaimStatus::Verifying => write!(f, "verifying"),
            ClaimStatus::Paid => write!(f, "paid"),
            ClaimStatus::Rejected => write!(f, "rejected"),
            ClaimStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Digested failure evidence. Raw response bodies are hashed at submission
/// time and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEvidence {
    /// HTTP status code of the failed response.
    pub status_code: u16,
    /// Response body length in bytes.
    pub body_len: u64,
    /// SHA-256 of the response body (hex).
    pub body_hash: String,
    /// SHA-256 of the canonicalized response headers (hex).
    pub headers_hash: String,
}

/// Opaque proof produced by the external prover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    /// Hex-encoded proof blob.
    pub blob: String,
    /// Public inputs: `[is_failure, status, body_len, suggested_payout]`.
    pub public_inputs: Vec<u64>,
    /// Proof generation wall time in milliseconds.
    pub generation_time_ms: u64,
}

/// A request to pay out against a policy, retained forever as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Persisted record format version.
    #[serde(default = "current_record_version")]
    pub record_version: u32,
    /// Unique claim identifier.
    pub claim_id: ClaimId,
    /// Owning policy.
    pub policy_id: PolicyId,
    /// Caller-supplied or derived idempotency key.
    pub idempotency_key: String,
    /// Lifecycle status.
    pub status: ClaimStatus,
    /// Digested failure evidence.
    pub evidence: ClaimEvidence,
    /// Proof data, present once the prover has run.
    #[serde(default)]
    pub proof: Option<ProofRecord>,
    /// Payout issued, in micro-units. At most the policy's coverage.
    #[serde(default)]
    pub payout_units: Option<u64>,
    /// Settlement transaction reference from the ledger.
    #[serde(default)]
    pub settlement_tx_ref: Option<String>,
    /// Human-readable reason, recorded for every terminal claim.
    #[serde(default)]
    pub reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the claim reached a terminal state.
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Precondition checked atomically with a policy update. A mismatch yields
/// `UpdateOutcome::Conflict` and the update does not apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyGuard {
    /// Required current status.
    pub status_is: Option<PolicyStatus>,
    /// Required current eligibility marker.
    pub pending_claim_is: Option<Option<ClaimId>>,
}

/// Allow-listed mutable policy fields. Anything not representable here
/// cannot be changed through the store.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    /// New lifecycle status.
    pub status: Option<PolicyStatus>,
    /// New eligibility marker (`Some(None)` clears it).
    pub pending_claim: Option<Option<ClaimId>>,
    /// New expiry time (renewal).
    pub expires_at: Option<DateTime<Utc>>,
    /// New renewal count.
    pub renewal_count: Option<u32>,
    /// New cumulative renewal fee total.
    pub total_renewal_fee_units: Option<u64>,
    /// Precondition for the update.
    pub guard: PolicyGuard,
}

impl PolicyUpdate {
    /// Whether the update carries no field changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.pending_claim.is_none()
            && self.expires_at.is_none()
            && self.renewal_count.is_none()
            && self.total_renewal_fee_units.is_none()
    }

    /// Apply the field changes to a policy record in place.
    pub fn apply(&self, policy: &mut Policy) {
        if let Some(status) = self.status {
            policy.status = status;
        }
        if let Some(pending) = self.pending_claim {
            policy.pending_claim = pending;
        }
        if let Some(expires_at) = self.expires_at {
            policy.expires_at = expires_at;
        }
        if let Some(count) = self.renewal_count {
            policy.renewal_count = count;
        }
        if let Some(total) = self.total_renewal_fee_units {
            policy.total_renewal_fee_units = total;
        }
    }

    /// Whether the guard holds against the current record.
    #[must_use]
    pub fn guard_holds(&self, policy: &Policy) -> bool {
        if let Some(status) = self.guard.status_is {
            if policy.status != status {
                return false;
            }
        }
        if let Some(pending) = self.guard.pending_claim_is {
            if policy.pending_claim != pending {
                return false;
            }
        }
        true
    }
}

/// Precondition checked atomically with a claim update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimGuard {
    /// Required current status.
    pub status_is: Option<ClaimStatus>,
}

/// Allow-listed mutable claim fields.
#[derive(Debug, Clone, Default)]
pub struct ClaimUpdate {
    /// New lifecycle status.
    pub status: Option<ClaimStatus>,
    /// Proof data.
    pub proof: Option<ProofRecord>,
    /// Payout issued.
    pub payout_units: Option<u64>,
    /// Settlement transaction reference.
    pub settlement_tx_ref: Option<String>,
    /// Terminal reason (`Some(None)` clears it on re-activation).
    pub reason: Option<Option<String>>,
    /// Finalization time (`Some(None)` clears it on re-activation).
    pub finalized_at: Option<Option<DateTime<Utc>>>,
    /// Precondition for the update.
    pub guard: ClaimGuard,
}

impl ClaimUpdate {
    /// Whether the update carries no field changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.proof.is_none()
            && self.payout_units.is_none()
            && self.settlement_tx_ref.is_none()
            && self.reason.is_none()
            && self.finalized_at.is_none()
    }

    /// Apply the field changes to a claim record in place.
    pub fn apply(&self, claim: &mut Claim) {
        if let Some(status) = self.status {
            claim.status = status;
        }
        if let Some(ref proof) = self.proof {
            claim.proof = Some(proof.clone());
        }
        if let Some(payout) = self.payout_units {
            claim.payout_units = Some(payout);
        }
        if let Some(ref tx_ref) = self.settlement_tx_ref {
            claim.settlement_tx_ref = Some(tx_ref.clone());
        }
        if let Some(ref reason) = self.reason {
            claim.reason = reason.clone();
        }
        if let Some(finalized_at) = self.finalized_at {
            claim.finalized_at = finalized_at;
        }
    }

    /// Whether the guard holds against the current record.
    #[must_use]
    pub fn guard_holds(&self, claim: &Claim) -> bool {
        if let Some(status) = self.guard.status_is {
            if claim.status != status {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> Policy {
        let now = Utc::now();
        Policy {
            record_version: RECORD_VERSION,
            policy_id: Uuid::new_v4(),
            owner_identity: "ab".repeat(32),
            target_hash: "cd".repeat(32),
            coverage_units: 10_000,
            premium_units: 100,
            status: PolicyStatus::Active,
            pending_claim: None,
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
            renewal_count: 0,
            total_renewal_fee_units: 0,
        }
    }

    #[test]
    fn claimable_requires_active_unexpired_unlocked() {
        let now = Utc::now();
        let mut policy = test_policy();
        assert!(policy.is_claimable(now));

        policy.pending_claim = Some(Uuid::new_v4());
        assert!(!policy.is_claimable(now));

        policy.pending_claim = None;
        policy.status = PolicyStatus::Claimed;
        assert!(!policy.is_claimable(now));

        policy.status = PolicyStatus::Active;
        assert!(!policy.is_claimable(now + chrono::Duration::hours(25)));
    }

    #[test]
    fn policy_guard_mismatch_detected() {
        let policy = test_policy();
        let update = PolicyUpdate {
            status: Some(PolicyStatus::Claimed),
            guard: PolicyGuard {
                status_is: Some(PolicyStatus::Active),
                pending_claim_is: Some(None),
            },
            ..Default::default()
        };
        assert!(update.guard_holds(&policy));

        let mut locked = policy;
        locked.pending_claim = Some(Uuid::new_v4());
        assert!(!update.guard_holds(&locked));
    }

    #[test]
    fn claim_update_clears_reason_on_reactivation() {
        let now = Utc::now();
        let mut claim = Claim {
            record_version: RECORD_VERSION,
            claim_id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            idempotency_key: "k1".to_string(),
            status: ClaimStatus::Failed,
            evidence: ClaimEvidence {
                status_code: 503,
                body_len: 0,
                body_hash: "00".repeat(32),
                headers_hash: "00".repeat(32),
            },
            proof: None,
            payout_units: None,
            settlement_tx_ref: None,
            reason: Some("prover timed out".to_string()),
            created_at: now,
            finalized_at: Some(now),
        };

        let update = ClaimUpdate {
            status: Some(ClaimStatus::Submitted),
            reason: Some(None),
            finalized_at: Some(None),
            guard: ClaimGuard {
                status_is: Some(ClaimStatus::Failed),
            },
            ..Default::default()
        };
        assert!(update.guard_holds(&claim));
        update.apply(&mut claim);
        assert_eq!(claim.status, ClaimStatus::Submitted);
        assert!(claim.reason.is_none());
        assert!(claim.finalized_at.is_none());
    }

    #[test]
    fn terminal_and_final_states() {
        assert!(ClaimStatus::Paid.is_terminal());
        assert!(ClaimStatus::Rejected.is_terminal());
        assert!(ClaimStatus::Failed.is_terminal());
        assert!(!ClaimStatus::Submitted.is_terminal());
        assert!(!ClaimStatus::Verifying.is_terminal());

        assert!(ClaimStatus::Paid.is_final());
        assert!(ClaimStatus::Rejected.is_final());
        assert!(!ClaimStatus::Failed.is_final());
    }
}
