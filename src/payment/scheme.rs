//! Pluggable signature schemes for payment authorizations.
//!
//! Both schemes authenticate the payer: the verified or recovered signer must
//! match the identity the authorization claims, and that identity becomes the
//! policy owner.

use crate::payment::{PaymentAuthorization, VerifyError};
use ed25519_dalek::{Signature as EdSignature, VerifyingKey as EdVerifyingKey};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey as EcdsaVerifyingKey};
use tracing::debug;

/// Capability to recover/validate a signer for a payment authorization.
pub trait SignatureScheme: Send + Sync {
    /// Scheme identifier for logs and configuration.
    fn name(&self) -> &'static str;

    /// Verify the authorization's signature and return the authenticated
    /// payer identity.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::InvalidSignature`] if the signature does not
    /// verify or the signer is not the claimed payer.
    fn verify(&self, auth: &PaymentAuthorization) -> Result<String, VerifyError>;
}

/// EdDSA over canonical JSON (ed25519).
///
/// The payer field is the hex-encoded 32-byte verifying key; the signature
/// is the hex-encoded 64-byte ed25519 signature over
/// [`PaymentAuthorization::canonical_json`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Scheme;

impl SignatureScheme for Ed25519Scheme {
    fn name(&self) -> &'static str {
        "ed25519"
    }

    fn verify(&self, auth: &PaymentAuthorization) -> Result<String, VerifyError> {
        let key_bytes: [u8; 32] = hex::decode(&auth.payer)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(VerifyError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = hex::decode(&auth.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(VerifyError::InvalidSignature)?;

        let key = EdVerifyingKey::from_bytes(&key_bytes).map_err(|e| {
            debug!("invalid ed25519 payer key: {e}");
            VerifyError::InvalidSignature
        })?;
        let signature = EdSignature::from_bytes(&sig_bytes);

        key.verify_strict(&auth.canonical_json(), &signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        Ok(auth.payer.to_lowercase())
    }
}

/// ECDSA with public-key recovery over a structured message (secp256k1).
///
/// The signature is 65 hex-encoded bytes: `r || s || v` where `v` is the
/// recovery id (0-3, with the legacy 27/28 offset accepted). The payer field
/// is the hex-encoded compressed SEC1 public key; recovery must reproduce it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaRecoverScheme;

impl SignatureScheme for EcdsaRecoverScheme {
    fn name(&self) -> &'static str {
        "ecdsa-recover"
    }

    fn verify(&self, auth: &PaymentAuthorization) -> Result<String, VerifyError> {
        let bytes = hex::decode(&auth.signature).map_err(|_| VerifyError::InvalidSignature)?;
        if bytes.len() != 65 {
            return Err(VerifyError::InvalidSignature);
        }

        let signature =
            EcdsaSignature::from_slice(&bytes[..64]).map_err(|_| VerifyError::InvalidSignature)?;
        let v = match bytes[64] {
            v @ 27..=30 => v - 27,
            v => v,
        };
        let recovery_id = RecoveryId::from_byte(v).ok_or(VerifyError::InvalidSignature)?;

        let recovered = EcdsaVerifyingKey::recover_from_digest(
            auth.structured_digest(),
            &signature,
            recovery_id,
        )
        .map_err(|e| {
            debug!("ecdsa recovery failed: {e}");
            VerifyError::InvalidSignature
        })?;

        let identity = hex::encode(recovered.to_encoded_point(true).as_bytes());
        if !identity.eq_ignore_ascii_case(&auth.payer) {
            debug!("recovered signer does not match claimed payer");
            return Err(VerifyError::InvalidSignature);
        }

        Ok(identity)
    }
}
