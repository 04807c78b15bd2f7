//! Durable entity store.
//!
//! Two interchangeable backends implement [`EntityStore`]: a JSON file store
//! for development and small deployments, and a SQLite store for anything
//! that needs to survive concurrent load. Both give the same guarantees:
//!
//! - writes are atomic; a crash mid-write leaves the previous state intact
//! - mutation goes through typed update payloads whose fields are the full
//!   allow-list of what can change
//! - updates carrying a guard apply only if the guard still holds, so
//!   check-then-act races surface as [`UpdateOutcome::Conflict`] instead of
//!   lost updates

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{Claim, ClaimId, ClaimUpdate, Policy, PolicyId, PolicyUpdate};

/// Outcome of a guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update applied.
    Updated,
    /// No entity with that identifier exists.
    NotFound,
    /// The guard did not hold; nothing changed.
    Conflict,
}

/// Synchronous persistence contract for policies and claims.
///
/// Implementations are internally synchronized; callers must not hold any
/// store handle across await points that could re-enter the store.
pub trait EntityStore: Send + Sync {
    /// Persist a new policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier already exists or the write fails.
    fn create_policy(&self, policy: &Policy) -> Result<()>;

    /// Fetch a policy by identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_policy(&self, policy_id: PolicyId) -> Result<Option<Policy>>;

    /// Apply a guarded, allow-listed update to a policy.
    ///
    /// An empty update on an existing record is a durable no-op that still
    /// reports [`UpdateOutcome::Updated`].
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. Guard mismatches are reported via
    /// [`UpdateOutcome::Conflict`], not as errors.
    fn update_policy(&self, policy_id: PolicyId, update: &PolicyUpdate) -> Result<UpdateOutcome>;

    /// All policies owned by `owner_identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn policies_by_owner(&self, owner_identity: &str) -> Result<Vec<Policy>>;

    /// Every stored policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn all_policies(&self) -> Result<Vec<Policy>>;

    /// Persist a new claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier or idempotency key already exists
    /// or the write fails.
    fn create_claim(&self, claim: &Claim) -> Result<()>;

    /// Fetch a claim by identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_claim(&self, claim_id: ClaimId) -> Result<Option<Claim>>;

    /// Apply a guarded, allow-listed update to a claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn update_claim(&self, claim_id: ClaimId, update: &ClaimUpdate) -> Result<UpdateOutcome>;

    /// Look up a claim by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn find_claim_by_idempotency_key(&self, key: &str) -> Result<Option<Claim>>;

    /// All claims filed against a policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn claims_for_policy(&self, policy_id: PolicyId) -> Result<Vec<Claim>>;

    /// Every stored claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn all_claims(&self) -> Result<Vec<Claim>>;
}
