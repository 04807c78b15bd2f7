//! Payment authorization parsing and canonical message construction.

use crate::payment::VerifyError;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Domain separator for the structured (ECDSA) message layout.
const STRUCTURED_DOMAIN: &[u8] = b"apicover-payment-v1";

/// A signed payment authorization as presented by a caller.
///
/// All fields are required; signatures and keys are hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAuthorization {
    /// Claimed payer identity (hex-encoded public key).
    pub payer: String,
    /// Authorized amount in micro-units.
    pub amount_units: u64,
    /// Settlement asset identifier.
    pub asset: String,
    /// Payment recipient identity.
    pub pay_to: String,
    /// Unix timestamp (seconds) the authorization was signed at.
    pub timestamp: i64,
    /// Single-use nonce bound to the payer.
    pub nonce: String,
    /// Hex-encoded signature over the canonical message.
    pub signature: String,
}

impl PaymentAuthorization {
    /// Parse the `key=value,key=value` authorization header format.
    ///
    /// Recognized keys: `payer`, `amount`, `asset`, `payTo`, `timestamp`,
    /// `nonce`, `signature`. All are required.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Malformed`] if a field is missing or does not
    /// parse.
    pub fn parse_header(header: &str) -> Result<Self, VerifyError> {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for item in header.split(',') {
            if let Some((key, value)) = item.split_once('=') {
                fields.insert(key.trim(), value.trim());
            }
        }

        let required = |key: &str| -> Result<String, VerifyError> {
            let value = fields
                .get(key)
                .ok_or_else(|| VerifyError::Malformed(format!("missing field: {key}")))?;
            if value.is_empty() {
                return Err(VerifyError::Malformed(format!("empty field: {key}")));
            }
            Ok((*value).to_string())
        };

        let amount_units = required("amount")?
            .parse::<u64>()
            .map_err(|e| VerifyError::Malformed(format!("invalid amount: {e}")))?;
        let timestamp = required("timestamp")?
            .parse::<i64>()
            .map_err(|e| VerifyError::Malformed(format!("invalid timestamp: {e}")))?;

        Ok(Self {
            payer: required("payer")?,
            amount_units,
            asset: required("asset")?,
            pay_to: required("payTo")?,
            timestamp,
            nonce: required("nonce")?,
            signature: required("signature")?,
        })
    }

    /// Canonical JSON message bytes for the EdDSA scheme.
    ///
    /// Keys are emitted in sorted order with compact separators, so the same
    /// logical payment always serializes to identical bytes. Signing any
    /// mutation of the fields produces a different message.
    #[must_use]
    pub fn canonical_json(&self) -> Vec<u8> {
        let mut map: BTreeMap<&str, Value> = BTreeMap::new();
        map.insert("amount", json!(self.amount_units));
        map.insert("asset", json!(self.asset));
        map.insert("nonce", json!(self.nonce));
        map.insert("payTo", json!(self.pay_to));
        map.insert("payer", json!(self.payer));
        map.insert("timestamp", json!(self.timestamp));
        // BTreeMap iteration order is the canonical (sorted) key order.
        serde_json::to_vec(&map).unwrap_or_default()
    }

    /// Structured message digest for the ECDSA recovery scheme.
    ///
    /// Layout: domain separator, then each field as a little-endian u64
    /// length prefix followed by its bytes, in fixed order.
    #[must_use]
    pub fn structured_digest(&self) -> Sha256 {
        let mut hasher = Sha256::new();
        hasher.update(STRUCTURED_DOMAIN);
        let fields: [&[u8]; 6] = [
            self.payer.as_bytes(),
            &self.amount_units.to_le_bytes(),
            self.asset.as_bytes(),
            self.pay_to.as_bytes(),
            &self.timestamp.to_le_bytes(),
            self.nonce.as_bytes(),
        ];
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hasher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> String {
        "payer=aabb, amount=100, asset=usdc-mint, payTo=backend, \
         timestamp=1700000000, nonce=n-1, signature=ccdd"
            .to_string()
    }

    #[test]
    fn parses_well_formed_header() {
        let auth = PaymentAuthorization::parse_header(&header()).expect("parses");
        assert_eq!(auth.payer, "aabb");
        assert_eq!(auth.amount_units, 100);
        assert_eq!(auth.pay_to, "backend");
        assert_eq!(auth.timestamp, 1_700_000_000);
        assert_eq!(auth.nonce, "n-1");
    }

    #[test]
    fn rejects_missing_field() {
        let result = PaymentAuthorization::parse_header("payer=aabb,amount=100");
        assert!(matches!(result, Err(VerifyError::Malformed(_))));
    }

    #[test]
    fn rejects_non_numeric_amount() {
        let bad = header().replace("amount=100", "amount=lots");
        assert!(matches!(
            PaymentAuthorization::parse_header(&bad),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn canonical_json_is_deterministic_and_mutation_sensitive() {
        let auth = PaymentAuthorization::parse_header(&header()).expect("parses");
        let first = auth.canonical_json();
        let second = auth.canonical_json();
        assert_eq!(first, second);

        let mut mutated = auth;
        mutated.amount_units = 101;
        assert_ne!(first, mutated.canonical_json());
    }

    #[test]
    fn structured_digest_differs_on_field_swap() {
        let auth = PaymentAuthorization::parse_header(&header()).expect("parses");
        // Swapping two string fields must not collide thanks to the length
        // prefixes.
        let mut swapped = auth.clone();
        std::mem::swap(&mut swapped.asset, &mut swapped.pay_to);
        let a = auth.structured_digest().finalize();
        let b = swapped.structured_digest().finalize();
        assert_ne!(a, b);
    }
}
