//! Policy issuance and renewal.
//!
//! A policy is created only from a [`VerifiedPayment`] whose amount equals
//! the premium for the requested coverage. The protected endpoint is hashed
//! before storage; the raw target never touches disk.

use crate::config::CoverConfig;
use crate::model::{Policy, PolicyGuard, PolicyId, PolicyStatus, PolicyUpdate, RECORD_VERSION};
use crate::payment::VerifiedPayment;
use crate::store::{EntityStore, UpdateOutcome};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Policy operation failure.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Requested coverage is outside the configured bounds.
    #[error("coverage {requested} outside allowed range {min}..={max}")]
    CoverageOutOfRange {
        /// Requested coverage in micro-units.
        requested: u64,
        /// Configured minimum.
        min: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The verified payment does not cover the required premium or fee.
    #[error("payment of {provided} does not match required {required}")]
    PremiumMismatch {
        /// Verified payment amount.
        provided: u64,
        /// Required amount.
        required: u64,
    },

    /// No policy with that identifier.
    #[error("policy not found")]
    NotFound,

    /// The payer does not own the policy.
    #[error("payer does not own this policy")]
    NotOwner,

    /// The policy is not in a renewable state.
    #[error("policy is not renewable: {0}")]
    NotRenewable(String),

    /// Requested renewal extension is outside the allowed range.
    #[error("renewal of {requested}h outside allowed range 1..={max}h")]
    RenewalOutOfRange {
        /// Requested extension in hours.
        requested: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The policy changed under us; retry.
    #[error("policy was modified concurrently")]
    Conflict,

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] crate::Error),
}

/// Issues and renews policies against the entity store.
pub struct PolicyManager {
    store: Arc<dyn EntityStore>,
    config: CoverConfig,
}

impl PolicyManager {
    /// Create a manager.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, config: CoverConfig) -> Self {
        Self { store, config }
    }

    /// Premium in micro-units for `coverage_units` of coverage.
    ///
    /// # Errors
    ///
    /// [`PolicyError::CoverageOutOfRange`] if the coverage is outside the
    /// configured bounds.
    pub fn premium_for(&self, coverage_units: u64) -> Result<u64, PolicyError> {
        if coverage_units < self.config.min_coverage_units
            || coverage_units > self.config.max_coverage_units
        {
            return Err(PolicyError::CoverageOutOfRange {
                requested: coverage_units,
                min: self.config.min_coverage_units,
                max: self.config.max_coverage_units,
            });
        }
        // bps of coverage, floor division. Fits easily: coverage and rate are
        // both bounded well below u128 territory, but widen anyway.
        let premium = u128::from(coverage_units) * u128::from(self.config.premium_rate_bps) / 10_000;
        Ok(u64::try_from(premium).unwrap_or(u64::MAX))
    }

    /// Pro-rated renewal fee for extending `coverage_units` by `hours`.
    ///
    /// The fee is the premium scaled by the extension relative to the base
    /// policy duration, rounded up so an extension is never free.
    ///
    /// # Errors
    ///
    /// [`PolicyError::RenewalOutOfRange`] if `hours` is zero or above the
    /// configured maximum.
    pub fn renewal_fee_for(&self, coverage_units: u64, hours: u64) -> Result<u64, PolicyError> {
        if hours == 0 || hours > self.config.max_renewal_hours {
            return Err(PolicyError::RenewalOutOfRange {
                requested: hours,
                max: self.config.max_renewal_hours,
            });
        }
        let numerator = u128::from(coverage_units)
            * u128::from(self.config.premium_rate_bps)
            * u128::from(hours);
        let denominator = u128::from(self.config.policy_duration_hours) * 10_000;
        let fee = numerator.div_ceil(denominator);
        Ok(u64::try_from(fee).unwrap_or(u64::MAX))
    }

    /// Issue a policy for `coverage_units` protecting `target`.
    ///
    /// # Errors
    ///
    /// Rejects coverage outside the configured range, a payment that does not
    /// equal the premium, or a store failure.
    pub fn issue(
        &self,
        payment: &VerifiedPayment,
        coverage_units: u64,
        target: &str,
    ) -> Result<Policy, PolicyError> {
        self.issue_at(payment, coverage_units, target, Utc::now())
    }

    /// [`issue`](Self::issue) with an explicit creation time.
    ///
    /// # Errors
    ///
    /// Same as [`issue`](Self::issue).
    pub fn issue_at(
        &self,
        payment: &VerifiedPayment,
        coverage_units: u64,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyError> {
        let premium = self.premium_for(coverage_units)?;
        if payment.amount_units != premium {
            return Err(PolicyError::PremiumMismatch {
                provided: payment.amount_units,
                required: premium,
            });
        }

        let duration_hours =
            i64::try_from(self.config.policy_duration_hours).unwrap_or(i64::MAX);
        let policy = Policy {
            record_version: RECORD_VERSION,
            policy_id: Uuid::new_v4(),
            owner_identity: payment.payer.clone(),
            target_hash: hash_target(target),
            coverage_units,
            premium_units: premium,
            status: PolicyStatus::Active,
            pending_claim: None,
            created_at: now,
            expires_at: now + Duration::hours(duration_hours),
            renewal_count: 0,
            total_renewal_fee_units: 0,
        };
        self.store.create_policy(&policy)?;

        info!(
            policy_id = %policy.policy_id,
            coverage_units,
            premium_units = premium,
            "policy issued"
        );
        Ok(policy)
    }

    /// Extend a policy's expiry by `hours` against a verified fee payment.
    ///
    /// Only the policy owner can renew, only while the policy is active and
    /// unexpired, and the payment must equal the pro-rated fee.
    ///
    /// # Errors
    ///
    /// See [`PolicyError`]; a concurrent modification surfaces as
    /// [`PolicyError::Conflict`].
    pub fn renew(
        &self,
        policy_id: PolicyId,
        payment: &VerifiedPayment,
        hours: u64,
    ) -> Result<Policy, PolicyError> {
        self.renew_at(policy_id, payment, hours, Utc::now())
    }

    /// [`renew`](Self::renew) with an explicit wall-clock time.
    ///
    /// # Errors
    ///
    /// Same as [`renew`](Self::renew).
    pub fn renew_at(
        &self,
        policy_id: PolicyId,
        payment: &VerifiedPayment,
        hours: u64,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyError> {
        let policy = self
            .store
            .get_policy(policy_id)?
            .ok_or(PolicyError::NotFound)?;

        if !policy
            .owner_identity
            .eq_ignore_ascii_case(&payment.payer)
        {
            return Err(PolicyError::NotOwner);
        }
        if policy.status != PolicyStatus::Active {
            return Err(PolicyError::NotRenewable(format!(
                "status is {}",
                policy.status
            )));
        }
        if policy.is_expired(now) {
            return Err(PolicyError::NotRenewable("policy has expired".to_string()));
        }

        let fee = self.renewal_fee_for(policy.coverage_units, hours)?;
        if payment.amount_units != fee {
            return Err(PolicyError::PremiumMismatch {
                provided: payment.amount_units,
                required: fee,
            });
        }

        let new_expiry = policy.expires_at + Duration::hours(i64::try_from(hours).unwrap_or(0));
        let update = PolicyUpdate {
            expires_at: Some(new_expiry),
            renewal_count: Some(policy.renewal_count + 1),
            total_renewal_fee_units: Some(policy.total_renewal_fee_units.saturating_add(fee)),
            guard: PolicyGuard {
                status_is: Some(PolicyStatus::Active),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.store.update_policy(policy_id, &update)? {
            UpdateOutcome::Updated => {}
            UpdateOutcome::NotFound => return Err(PolicyError::NotFound),
            UpdateOutcome::Conflict => return Err(PolicyError::Conflict),
        }

        info!(policy_id = %policy_id, hours, fee_units = fee, "policy renewed");
        self.store
            .get_policy(policy_id)?
            .ok_or(PolicyError::NotFound)
    }

    /// Fetch a policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get(&self, policy_id: PolicyId) -> Result<Option<Policy>, PolicyError> {
        Ok(self.store.get_policy(policy_id)?)
    }

    /// Active, unexpired policies owned by `owner_identity` at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn find_active_by_owner(
        &self,
        owner_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Policy>, PolicyError> {
        let mut policies = self.store.policies_by_owner(owner_identity)?;
        policies.retain(|p| p.status == PolicyStatus::Active && !p.is_expired(now));
        Ok(policies)
    }
}

fn hash_target(target: &str) -> String {
    hex::encode(Sha256::digest(target.as_bytes()))
}
