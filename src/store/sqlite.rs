//! SQLite-backed entity store.
//!
//! One connection in WAL mode behind a mutex. Guarded updates run inside an
//! immediate transaction: the row is read, the guard checked, and the fixed
//! set of mutable columns rewritten, so concurrent writers serialize and a
//! lost guard shows up as a conflict rather than a lost update.

use crate::error::{Error, Result};
use crate::model::{
    Claim, ClaimEvidence, ClaimId, ClaimStatus, ClaimUpdate, Policy, PolicyId, PolicyStatus,
    PolicyUpdate, ProofRecord,
};
use crate::store::{EntityStore, UpdateOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS policies (
    policy_id               TEXT PRIMARY KEY,
    record_version          INTEGER NOT NULL,
    owner_identity          TEXT NOT NULL,
    target_hash             TEXT NOT NULL,
    coverage_units          INTEGER NOT NULL,
    premium_units           INTEGER NOT NULL,
    status                  TEXT NOT NULL,
    pending_claim           TEXT,
    created_at              TEXT NOT NULL,
    expires_at              TEXT NOT NULL,
    renewal_count           INTEGER NOT NULL DEFAULT 0,
    total_renewal_fee_units INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_policies_owner ON policies(owner_identity);

CREATE TABLE IF NOT EXISTS claims (
    claim_id          TEXT PRIMARY KEY,
    record_version    INTEGER NOT NULL,
    policy_id         TEXT NOT NULL REFERENCES policies(policy_id),
    idempotency_key   TEXT NOT NULL UNIQUE,
    status            TEXT NOT NULL,
    status_code       INTEGER NOT NULL,
    body_len          INTEGER NOT NULL,
    body_hash         TEXT NOT NULL,
    headers_hash      TEXT NOT NULL,
    proof_json        TEXT,
    payout_units      INTEGER,
    settlement_tx_ref TEXT,
    reason            TEXT,
    created_at        TEXT NOT NULL,
    finalized_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_claims_policy ON claims(policy_id);
";

/// [`EntityStore`] backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        info!("SQLite store opened at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_db_amount(units: u64, what: &str) -> Result<i64> {
    i64::try_from(units).map_err(|_| Error::Store(format!("{what} out of range: {units}")))
}

fn from_db_amount(value: i64, _what: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, value))
}

fn parse_time(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_uuid(text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn policy_status_str(status: PolicyStatus) -> &'static str {
    match status {
        PolicyStatus::Active => "active",
        PolicyStatus::Claimed => "claimed",
        PolicyStatus::Expired => "expired",
    }
}

fn parse_policy_status(text: &str) -> rusqlite::Result<PolicyStatus> {
    match text {
        "active" => Ok(PolicyStatus::Active),
        "claimed" => Ok(PolicyStatus::Claimed),
        "expired" => Ok(PolicyStatus::Expired),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn claim_status_str(status: ClaimStatus) -> &'static str {
    match status {
        ClaimStatus::Submitted => "submitted",
        ClaimStatus::Verifying => "verifying",
        ClaimStatus::Paid => "paid",
        ClaimStatus::Rejected => "rejected",
        ClaimStatus::Failed => "failed",
    }
}

fn parse_claim_status(text: &str) -> rusqlite::Result<ClaimStatus> {
    match text {
        "submitted" => Ok(ClaimStatus::Submitted),
        "verifying" => Ok(ClaimStatus::Verifying),
        "paid" => Ok(ClaimStatus::Paid),
        "rejected" => Ok(ClaimStatus::Rejected),
        "failed" => Ok(ClaimStatus::Failed),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<Policy> {
    let pending: Option<String> = row.get("pending_claim")?;
    Ok(Policy {
        policy_id: parse_uuid(&row.get::<_, String>("policy_id")?)?,
        record_version: row.get("record_version")?,
        owner_identity: row.get("owner_identity")?,
        target_hash: row.get("target_hash")?,
        coverage_units: from_db_amount(row.get("coverage_units")?, "coverage")?,
        premium_units: from_db_amount(row.get("premium_units")?, "premium")?,
        status: parse_policy_status(&row.get::<_, String>("status")?)?,
        pending_claim: pending.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_time(&row.get::<_, String>("created_at")?)?,
        expires_at: parse_time(&row.get::<_, String>("expires_at")?)?,
        renewal_count: row.get("renewal_count")?,
        total_renewal_fee_units: from_db_amount(
            row.get("total_renewal_fee_units")?,
            "renewal fees",
        )?,
    })
}

fn claim_from_row(row: &Row<'_>) -> rusqlite::Result<Claim> {
    let proof_json: Option<String> = row.get("proof_json")?;
    let proof: Option<ProofRecord> = proof_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|_| rusqlite::Error::InvalidQuery)?;
    let payout: Option<i64> = row.get("payout_units")?;
    let finalized: Option<String> = row.get("finalized_at")?;
    Ok(Claim {
        claim_id: parse_uuid(&row.get::<_, String>("claim_id")?)?,
        record_version: row.get("record_version")?,
        policy_id: parse_uuid(&row.get::<_, String>("policy_id")?)?,
        idempotency_key: row.get("idempotency_key")?,
        status: parse_claim_status(&row.get::<_, String>("status")?)?,
        evidence: ClaimEvidence {
            status_code: row.get("status_code")?,
            body_len: from_db_amount(row.get("body_len")?, "body length")?,
            body_hash: row.get("body_hash")?,
            headers_hash: row.get("headers_hash")?,
        },
        proof,
        payout_units: payout.map(|p| from_db_amount(p, "payout")).transpose()?,
        settlement_tx_ref: row.get("settlement_tx_ref")?,
        reason: row.get("reason")?,
        created_at: parse_time(&row.get::<_, String>("created_at")?)?,
        finalized_at: finalized.as_deref().map(parse_time).transpose()?,
    })
}

impl EntityStore for SqliteStore {
    fn create_policy(&self, policy: &Policy) -> Result<()> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO policies (
                policy_id, record_version, owner_identity, target_hash,
                coverage_units, premium_units, status, pending_claim,
                created_at, expires_at, renewal_count, total_renewal_fee_units
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                policy.policy_id.to_string(),
                policy.record_version,
                policy.owner_identity,
                policy.target_hash,
                to_db_amount(policy.coverage_units, "coverage")?,
                to_db_amount(policy.premium_units, "premium")?,
                policy_status_str(policy.status),
                policy.pending_claim.map(|id| id.to_string()),
                policy.created_at.to_rfc3339(),
                policy.expires_at.to_rfc3339(),
                policy.renewal_count,
                to_db_amount(policy.total_renewal_fee_units, "renewal fees")?,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Store(format!(
                "policy {} already exists",
                policy.policy_id
            )));
        }
        Ok(())
    }

    fn get_policy(&self, policy_id: PolicyId) -> Result<Option<Policy>> {
        let conn = self.conn.lock();
        let policy = conn
            .query_row(
                "SELECT * FROM policies WHERE policy_id = ?1",
                params![policy_id.to_string()],
                policy_from_row,
            )
            .optional()?;
        Ok(policy)
    }

    fn update_policy(&self, policy_id: PolicyId, update: &PolicyUpdate) -> Result<UpdateOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut policy) = tx
            .query_row(
                "SELECT * FROM policies WHERE policy_id = ?1",
                params![policy_id.to_string()],
                policy_from_row,
            )
            .optional()?
        else {
            return Ok(UpdateOutcome::NotFound);
        };

        if !update.guard_holds(&policy) {
            return Ok(UpdateOutcome::Conflict);
        }

        update.apply(&mut policy);
        tx.execute(
            "UPDATE policies SET
                status = ?2, pending_claim = ?3, expires_at = ?4,
                renewal_count = ?5, total_renewal_fee_units = ?6
             WHERE policy_id = ?1",
            params![
                policy_id.to_string(),
                policy_status_str(policy.status),
                policy.pending_claim.map(|id| id.to_string()),
                policy.expires_at.to_rfc3339(),
                policy.renewal_count,
                to_db_amount(policy.total_renewal_fee_units, "renewal fees")?,
            ],
        )?;
        tx.commit()?;
        Ok(UpdateOutcome::Updated)
    }

    fn policies_by_owner(&self, owner_identity: &str) -> Result<Vec<Policy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM policies WHERE owner_identity = ?1 COLLATE NOCASE",
        )?;
        let rows = stmt.query_map(params![owner_identity], policy_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn all_policies(&self) -> Result<Vec<Policy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM policies")?;
        let rows = stmt.query_map([], policy_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_claim(&self, claim: &Claim) -> Result<()> {
        let conn = self.conn.lock();
        let proof_json = claim
            .proof
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO claims (
                claim_id, record_version, policy_id, idempotency_key, status,
                status_code, body_len, body_hash, headers_hash, proof_json,
                payout_units, settlement_tx_ref, reason, created_at, finalized_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                claim.claim_id.to_string(),
                claim.record_version,
                claim.policy_id.to_string(),
                claim.idempotency_key,
                claim_status_str(claim.status),
                claim.evidence.status_code,
                to_db_amount(claim.evidence.body_len, "body length")?,
                claim.evidence.body_hash,
                claim.evidence.headers_hash,
                proof_json,
                claim
                    .payout_units
                    .map(|p| to_db_amount(p, "payout"))
                    .transpose()?,
                claim.settlement_tx_ref,
                claim.reason,
                claim.created_at.to_rfc3339(),
                claim.finalized_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| Error::Store(format!("claim insert failed: {e}")))?;
        Ok(())
    }

    fn get_claim(&self, claim_id: ClaimId) -> Result<Option<Claim>> {
        let conn = self.conn.lock();
        let claim = conn
            .query_row(
                "SELECT * FROM claims WHERE claim_id = ?1",
                params![claim_id.to_string()],
                claim_from_row,
            )
            .optional()?;
        Ok(claim)
    }

    fn update_claim(&self, claim_id: ClaimId, update: &ClaimUpdate) -> Result<UpdateOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut claim) = tx
            .query_row(
                "SELECT * FROM claims WHERE claim_id = ?1",
                params![claim_id.to_string()],
                claim_from_row,
            )
            .optional()?
        else {
            return Ok(UpdateOutcome::NotFound);
        };

        if !update.guard_holds(&claim) {
            return Ok(UpdateOutcome::Conflict);
        }

        update.apply(&mut claim);
        let proof_json = claim
            .proof
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "UPDATE claims SET
                status = ?2, proof_json = ?3, payout_units = ?4,
                settlement_tx_ref = ?5, reason = ?6, finalized_at = ?7
             WHERE claim_id = ?1",
            params![
                claim_id.to_string(),
                claim_status_str(claim.status),
                proof_json,
                claim
                    .payout_units
                    .map(|p| to_db_amount(p, "payout"))
                    .transpose()?,
                claim.settlement_tx_ref,
                claim.reason,
                claim.finalized_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.commit()?;
        Ok(UpdateOutcome::Updated)
    }

    fn find_claim_by_idempotency_key(&self, key: &str) -> Result<Option<Claim>> {
        let conn = self.conn.lock();
        let claim = conn
            .query_row(
                "SELECT * FROM claims WHERE idempotency_key = ?1",
                params![key],
                claim_from_row,
            )
            .optional()?;
        Ok(claim)
    }

    fn claims_for_policy(&self, policy_id: PolicyId) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM claims WHERE policy_id = ?1")?;
        let rows = stmt.query_map(params![policy_id.to_string()], claim_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn all_claims(&self) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM claims")?;
        let rows = stmt.query_map([], claim_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
