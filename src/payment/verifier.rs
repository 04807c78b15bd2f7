//! End-to-end payment authorization verification.

use crate::config::PaymentConfig;
use crate::payment::{NonceLedger, PaymentAuthorization, SignatureScheme, VerifyError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// A payment authorization that passed every verification step.
///
/// Construction goes through [`PaymentVerifier::verify`] only, so holding a
/// `VerifiedPayment` means the signature checked out and the nonce was
/// durably consumed.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    /// Authenticated payer identity (lowercase hex).
    pub payer: String,
    /// Verified amount in micro-units.
    pub amount_units: u64,
    /// Settlement asset.
    pub asset: String,
    /// Recipient the payment was made to.
    pub pay_to: String,
    /// Authorization timestamp.
    pub timestamp: i64,
    /// The consumed nonce.
    pub nonce: String,
}

/// Verifies payment authorizations against a configured recipient, asset,
/// freshness window and replay ledger.
pub struct PaymentVerifier {
    scheme: Box<dyn SignatureScheme>,
    nonces: Arc<NonceLedger>,
    config: PaymentConfig,
}

impl PaymentVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(
        scheme: Box<dyn SignatureScheme>,
        nonces: Arc<NonceLedger>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            scheme,
            nonces,
            config,
        }
    }

    /// Verify `auth` as payment of exactly `required_units`.
    ///
    /// Checks run cheapest-first: field validation, freshness, signature,
    /// then the nonce ledger. The nonce is only consumed after everything
    /// else passed, so a rejected authorization can be corrected and
    /// resubmitted with the same nonce.
    ///
    /// # Errors
    ///
    /// Returns the [`VerifyError`] for the first check that fails.
    pub fn verify(
        &self,
        auth: &PaymentAuthorization,
        required_units: u64,
    ) -> Result<VerifiedPayment, VerifyError> {
        self.verify_at(auth, required_units, Utc::now().timestamp())
    }

    /// [`verify`](Self::verify) against an explicit wall-clock time.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify).
    pub fn verify_at(
        &self,
        auth: &PaymentAuthorization,
        required_units: u64,
        now: i64,
    ) -> Result<VerifiedPayment, VerifyError> {
        if auth.amount_units != required_units {
            return Err(VerifyError::AmountMismatch {
                provided: auth.amount_units,
                required: required_units,
            });
        }

        if !auth.pay_to.eq_ignore_ascii_case(&self.config.recipient) {
            return Err(VerifyError::RecipientMismatch {
                provided: auth.pay_to.clone(),
            });
        }

        if !self.config.asset.is_empty() && !auth.asset.eq_ignore_ascii_case(&self.config.asset) {
            return Err(VerifyError::AssetMismatch {
                provided: auth.asset.clone(),
            });
        }

        // The timestamp is caller-controlled; saturate instead of trusting
        // it to stay within subtraction range.
        let offset = auth.timestamp.saturating_sub(now);
        let skew = i64::try_from(self.config.clock_skew_secs).unwrap_or(i64::MAX);
        let max_age = i64::try_from(self.config.max_age_secs).unwrap_or(i64::MAX);
        if offset > skew || offset < -max_age {
            debug!("rejecting stale authorization, offset {offset}s");
            return Err(VerifyError::StaleTimestamp {
                offset_secs: offset,
            });
        }

        let payer = self.scheme.verify(auth)?;

        match self.nonces.check_and_insert(&payer, &auth.nonce, now) {
            Ok(()) => {}
            Err(VerifyError::ReplayedNonce) => {
                // A replay of a valid signature is an attack signal, not a
                // malformed request.
                warn!(payer = %payer, "replayed payment nonce rejected");
                return Err(VerifyError::ReplayedNonce);
            }
            Err(e) => return Err(e),
        }

        Ok(VerifiedPayment {
            payer,
            amount_units: auth.amount_units,
            asset: auth.asset.clone(),
            pay_to: auth.pay_to.clone(),
            timestamp: auth.timestamp,
            nonce: auth.nonce.clone(),
        })
    }
}
