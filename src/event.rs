//! Service event system.

use crate::model::{ClaimId, PolicyId};
use crate::reserve::ReserveStatus;
use tokio::sync::broadcast;

/// Events emitted by the service.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Service has started successfully.
    Started,

    /// Service is shutting down.
    ShuttingDown,

    /// A policy was issued after a verified payment.
    PolicyIssued {
        /// Policy identifier.
        policy_id: PolicyId,
        /// Coverage in micro-units.
        coverage_units: u64,
    },

    /// A policy was renewed before expiry.
    PolicyRenewed {
        /// Policy identifier.
        policy_id: PolicyId,
        /// Hours the expiry was extended by.
        extended_hours: u64,
    },

    /// A claim was accepted for background processing.
    ClaimSubmitted {
        /// Claim identifier.
        claim_id: ClaimId,
        /// Owning policy.
        policy_id: PolicyId,
    },

    /// A claim payout was issued.
    ClaimPaid {
        /// Claim identifier.
        claim_id: ClaimId,
        /// Payout in micro-units.
        payout_units: u64,
        /// Settlement transaction reference.
        tx_ref: String,
    },

    /// A claim was rejected: the evidence did not show a covered failure.
    ClaimRejected {
        /// Claim identifier.
        claim_id: ClaimId,
        /// Rejection reason.
        reason: String,
    },

    /// Claim processing failed downstream; the claim may be resubmitted.
    ClaimFailed {
        /// Claim identifier.
        claim_id: ClaimId,
        /// Failure reason.
        reason: String,
    },

    /// A replayed payment nonce was detected.
    ReplayDetected {
        /// Payer identity the replay was attempted for.
        owner_identity: String,
    },

    /// Result of a reserve health check.
    ReserveChecked {
        /// Health status.
        status: ReserveStatus,
        /// Current reserve balance in micro-units.
        balance_units: u64,
        /// Outstanding active coverage in micro-units.
        outstanding_units: u64,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving service events.
pub type ServiceEventsChannel = broadcast::Receiver<ServiceEvent>;

/// Sender for service events.
pub type ServiceEventsSender = broadcast::Sender<ServiceEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (ServiceEventsSender, ServiceEventsChannel) {
    broadcast::channel(256)
}
