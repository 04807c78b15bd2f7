//! JSON file-backed entity store.
//!
//! Policies and claims live in two JSON files under the data directory. All
//! state is held in memory and every mutation rewrites the affected file
//! atomically (temp file, fsync, rename), so a crash mid-write leaves the
//! previous state intact. An exclusive advisory lock on a sentinel file
//! prevents a second process from opening the same directory.

use crate::error::{Error, Result};
use crate::model::{Claim, ClaimId, ClaimUpdate, Policy, PolicyId, PolicyUpdate};
use crate::store::{EntityStore, UpdateOutcome};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const POLICIES_FILE: &str = "policies.json";
const CLAIMS_FILE: &str = "claims.json";
const LOCK_FILE: &str = ".store.lock";

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the target.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

struct Inner {
    policies: HashMap<PolicyId, Policy>,
    claims: HashMap<ClaimId, Claim>,
}

/// [`EntityStore`] backed by JSON files.
pub struct FileStore {
    inner: Mutex<Inner>,
    dir: PathBuf,
    // Held for the lifetime of the store; dropping releases the lock.
    _lock: File,
}

impl FileStore {
    /// Open (or create) a file store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, another process
    /// holds the store lock, or an existing data file is unreadable or
    /// corrupt.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let lock = File::create(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|e| {
            Error::Store(format!(
                "store directory {} is locked by another process: {e}",
                dir.display()
            ))
        })?;

        let policies: HashMap<PolicyId, Policy> = load_map(&dir.join(POLICIES_FILE))?;
        let claims: HashMap<ClaimId, Claim> = load_map(&dir.join(CLAIMS_FILE))?;

        info!(
            "File store opened at {}: {} policies, {} claims",
            dir.display(),
            policies.len(),
            claims.len()
        );

        Ok(Self {
            inner: Mutex::new(Inner { policies, claims }),
            dir,
            _lock: lock,
        })
    }

    fn persist_policies(&self, inner: &Inner) -> Result<()> {
        let content = serde_json::to_vec_pretty(&inner.policies)?;
        atomic_write_bytes(&self.dir.join(POLICIES_FILE), &content)?;
        Ok(())
    }

    fn persist_claims(&self, inner: &Inner) -> Result<()> {
        let content = serde_json::to_vec_pretty(&inner.claims)?;
        atomic_write_bytes(&self.dir.join(CLAIMS_FILE), &content)?;
        Ok(())
    }
}

fn load_map<K, V>(path: &Path) -> Result<HashMap<K, V>>
where
    K: std::hash::Hash + Eq + serde::de::DeserializeOwned,
    V: serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Store(format!("corrupt store file {}: {e}", path.display())))
}

impl EntityStore for FileStore {
    fn create_policy(&self, policy: &Policy) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.policies.contains_key(&policy.policy_id) {
            return Err(Error::Store(format!(
                "policy {} already exists",
                policy.policy_id
            )));
        }
        inner.policies.insert(policy.policy_id, policy.clone());
        if let Err(e) = self.persist_policies(&inner) {
            inner.policies.remove(&policy.policy_id);
            return Err(e);
        }
        Ok(())
    }

    fn get_policy(&self, policy_id: PolicyId) -> Result<Option<Policy>> {
        Ok(self.inner.lock().policies.get(&policy_id).cloned())
    }

    fn update_policy(&self, policy_id: PolicyId, update: &PolicyUpdate) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.policies.get(&policy_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if !update.guard_holds(current) {
            return Ok(UpdateOutcome::Conflict);
        }
        let previous = current.clone();
        let entry = inner
            .policies
            .get_mut(&policy_id)
            .ok_or_else(|| Error::Store("policy vanished under lock".to_string()))?;
        update.apply(entry);
        if let Err(e) = self.persist_policies(&inner) {
            inner.policies.insert(policy_id, previous);
            return Err(e);
        }
        Ok(UpdateOutcome::Updated)
    }

    fn policies_by_owner(&self, owner_identity: &str) -> Result<Vec<Policy>> {
        let inner = self.inner.lock();
        Ok(inner
            .policies
            .values()
            .filter(|p| p.owner_identity.eq_ignore_ascii_case(owner_identity))
            .cloned()
            .collect())
    }

    fn all_policies(&self) -> Result<Vec<Policy>> {
        Ok(self.inner.lock().policies.values().cloned().collect())
    }

    fn create_claim(&self, claim: &Claim) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.claims.contains_key(&claim.claim_id) {
            return Err(Error::Store(format!(
                "claim {} already exists",
                claim.claim_id
            )));
        }
        if inner
            .claims
            .values()
            .any(|c| c.idempotency_key == claim.idempotency_key)
        {
            return Err(Error::Store(format!(
                "idempotency key {} already exists",
                claim.idempotency_key
            )));
        }
        inner.claims.insert(claim.claim_id, claim.clone());
        if let Err(e) = self.persist_claims(&inner) {
            inner.claims.remove(&claim.claim_id);
            return Err(e);
        }
        Ok(())
    }

    fn get_claim(&self, claim_id: ClaimId) -> Result<Option<Claim>> {
        Ok(self.inner.lock().claims.get(&claim_id).cloned())
    }

    fn update_claim(&self, claim_id: ClaimId, update: &ClaimUpdate) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.claims.get(&claim_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if !update.guard_holds(current) {
            return Ok(UpdateOutcome::Conflict);
        }
        let previous = current.clone();
        let entry = inner
            .claims
            .get_mut(&claim_id)
            .ok_or_else(|| Error::Store("claim vanished under lock".to_string()))?;
        update.apply(entry);
        if let Err(e) = self.persist_claims(&inner) {
            inner.claims.insert(claim_id, previous);
            return Err(e);
        }
        Ok(UpdateOutcome::Updated)
    }

    fn find_claim_by_idempotency_key(&self, key: &str) -> Result<Option<Claim>> {
        let inner = self.inner.lock();
        Ok(inner
            .claims
            .values()
            .find(|c| c.idempotency_key == key)
            .cloned())
    }

    fn claims_for_policy(&self, policy_id: PolicyId) -> Result<Vec<Claim>> {
        let inner = self.inner.lock();
        Ok(inner
            .claims
            .values()
            .filter(|c| c.policy_id == policy_id)
            .cloned()
            .collect())
    }

    fn all_claims(&self) -> Result<Vec<Claim>> {
        Ok(self.inner.lock().claims.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClaimEvidence, ClaimStatus, PolicyGuard, PolicyStatus, RECORD_VERSION};
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

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

    fn test_claim(policy_id: PolicyId, key: &str) -> Claim {
        Claim {
            record_version: RECORD_VERSION,
            claim_id: Uuid::new_v4(),
            policy_id,
            idempotency_key: key.to_string(),
            status: ClaimStatus::Submitted,
            evidence: ClaimEvidence {
                status_code: 503,
                body_len: 0,
                body_hash: "00".repeat(32),
                headers_hash: "11".repeat(32),
            },
            proof: None,
            payout_units: None,
            settlement_tx_ref: None,
            reason: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn create_get_roundtrip_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let policy = test_policy();
        let claim = test_claim(policy.policy_id, "k-1");
        {
            let store = FileStore::open(dir.path()).expect("open");
            store.create_policy(&policy).expect("create policy");
            store.create_claim(&claim).expect("create claim");
        }
        let store = FileStore::open(dir.path()).expect("reopen");
        assert_eq!(store.get_policy(policy.policy_id).expect("get"), Some(policy));
        assert_eq!(store.get_claim(claim.claim_id).expect("get"), Some(claim));
    }

    #[test]
    fn duplicate_identifiers_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        let policy = test_policy();
        store.create_policy(&policy).expect("create");
        assert!(store.create_policy(&policy).is_err());

        let claim = test_claim(policy.policy_id, "k-1");
        store.create_claim(&claim).expect("create claim");
        let mut other = test_claim(policy.policy_id, "k-1");
        other.claim_id = Uuid::new_v4();
        assert!(store.create_claim(&other).is_err());
    }

    #[test]
    fn guarded_update_conflicts_instead_of_clobbering() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        let policy = test_policy();
        store.create_policy(&policy).expect("create");

        let lock_claim = Uuid::new_v4();
        let lock = PolicyUpdate {
            pending_claim: Some(Some(lock_claim)),
            guard: PolicyGuard {
                status_is: Some(PolicyStatus::Active),
                pending_claim_is: Some(None),
            },
            ..Default::default()
        };
        assert_eq!(
            store.update_policy(policy.policy_id, &lock).expect("update"),
            UpdateOutcome::Updated
        );
        // Same guarded update again: the marker is now set, guard fails.
        assert_eq!(
            store.update_policy(policy.policy_id, &lock).expect("update"),
            UpdateOutcome::Conflict
        );
        let stored = store
            .get_policy(policy.policy_id)
            .expect("get")
            .expect("exists");
        assert_eq!(stored.pending_claim, Some(lock_claim));
    }

    #[test]
    fn update_missing_entity_reports_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        assert_eq!(
            store
                .update_policy(Uuid::new_v4(), &PolicyUpdate::default())
                .expect("update"),
            UpdateOutcome::NotFound
        );
    }

    #[test]
    fn leftover_temp_file_is_ignored_on_open() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = FileStore::open(dir.path()).expect("open");
            store.create_policy(&test_policy()).expect("create");
        }
        // Simulate a crash that left a torn temp file behind.
        std::fs::write(dir.path().join(".tmpXYZ"), b"{ torn").expect("write");
        let store = FileStore::open(dir.path()).expect("reopen");
        assert_eq!(store.all_policies().expect("all").len(), 1);
    }

    #[test]
    fn second_open_of_locked_directory_fails() {
        let dir = TempDir::new().expect("tempdir");
        let _store = FileStore::open(dir.path()).expect("open");
        assert!(FileStore::open(dir.path()).is_err());
    }

    #[test]
    fn idempotency_key_lookup() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        let policy = test_policy();
        store.create_policy(&policy).expect("create");
        let claim = test_claim(policy.policy_id, "k-42");
        store.create_claim(&claim).expect("create claim");

        let found = store
            .find_claim_by_idempotency_key("k-42")
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.claim_id, claim.claim_id);
        assert!(store
            .find_claim_by_idempotency_key("k-other")
            .expect("lookup")
            .is_none());
    }
}
