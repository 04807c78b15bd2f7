//! Payment authorization verification.
//!
//! A caller pays the premium out-of-band and presents a signed authorization
//! naming the amount, recipient, asset, a timestamp and a single-use nonce.
//! Verification is exactly-once:
//!
//! ```text
//! authorization header
//!        │
//!        ▼
//! ┌───────────────────┐
//! │ parse + field     │──▶ Malformed / AmountMismatch /
//! │ validation        │    RecipientMismatch / AssetMismatch
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │ freshness window  │──▶ StaleTimestamp
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │ signature scheme  │──▶ InvalidSignature
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │ nonce ledger      │──▶ ReplayedNonce
//! │ check-and-insert  │    (atomic, durable before success)
//! └───────────────────┘
//! ```

mod authorization;
mod nonce;
mod scheme;
mod verifier;

pub use authorization::PaymentAuthorization;
pub use nonce::NonceLedger;
pub use scheme::{EcdsaRecoverScheme, Ed25519Scheme, SignatureScheme};
pub use verifier::{PaymentVerifier, VerifiedPayment};

use thiserror::Error;

/// Payment verification failure.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The authorization could not be parsed or is missing fields.
    #[error("malformed payment authorization: {0}")]
    Malformed(String),

    /// The authorized amount does not match the required amount.
    #[error("payment amount mismatch: provided {provided}, required {required}")]
    AmountMismatch {
        /// Amount named by the authorization.
        provided: u64,
        /// Amount the operation requires.
        required: u64,
    },

    /// The authorization names the wrong recipient.
    #[error("payment recipient mismatch: {provided}")]
    RecipientMismatch {
        /// Recipient named by the authorization.
        provided: String,
    },

    /// The authorization names the wrong settlement asset.
    #[error("payment asset mismatch: {provided}")]
    AssetMismatch {
        /// Asset named by the authorization.
        provided: String,
    },

    /// The authorization timestamp is outside the freshness window.
    #[error("payment timestamp outside freshness window (offset {offset_secs}s)")]
    StaleTimestamp {
        /// Signed offset of the timestamp from verifier time, in seconds.
        offset_secs: i64,
    },

    /// The signature does not verify, or the signer is not the claimed payer.
    #[error("invalid payment signature")]
    InvalidSignature,

    /// The (payer, nonce) pair has already been used.
    #[error("replayed payment nonce")]
    ReplayedNonce,

    /// The nonce could not be durably recorded; the payment is not accepted.
    #[error("nonce persistence failed: {0}")]
    Storage(#[from] crate::Error),
}
