//! Durable nonce ledger for payment replay protection.
//!
//! Each accepted authorization consumes its `(payer, nonce)` pair exactly
//! once. The ledger is held in memory under a single mutex and persisted
//! atomically on every insert, so a nonce is only considered spent once it is
//! durable, and the check-and-insert has no TOCTOU window.

use crate::error::{Error, Result};
use crate::payment::VerifyError;
use crate::store::file::atomic_write_bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

struct Inner {
    /// `"{owner}:{nonce}"` → unix timestamp of first use.
    nonces: HashMap<String, i64>,
    last_gc: i64,
}

/// Persistent set of used `(payer, nonce)` pairs.
pub struct NonceLedger {
    inner: Mutex<Inner>,
    path: PathBuf,
    retention: Duration,
}

impl NonceLedger {
    /// Open (or create) the ledger at `path`.
    ///
    /// `retention` is how long spent nonces are kept before garbage
    /// collection; it must be strictly longer than the verification freshness
    /// window, which the caller validates via
    /// [`ServiceConfig::validate`](crate::ServiceConfig::validate).
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger file cannot be read or parsed.
    /// A corrupt ledger is an error, not an empty ledger: silently starting
    /// fresh would reopen the replay window.
    pub fn open(path: PathBuf, retention: Duration) -> Result<Self> {
        let nonces = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<HashMap<String, i64>>(&content)
                .map_err(|e| Error::Store(format!("corrupt nonce ledger {}: {e}", path.display())))?
        } else {
            HashMap::new()
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(
            "Nonce ledger opened: {} spent nonces loaded from {}",
            nonces.len(),
            path.display()
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                nonces,
                last_gc: Utc::now().timestamp(),
            }),
            path,
            retention,
        })
    }

    /// Atomically check and insert `(owner, nonce)`.
    ///
    /// The mutex is held across the check, the insert and the durable write:
    /// concurrent verification attempts with the same nonce serialize here,
    /// and exactly one wins. If the write fails the insert is rolled back and
    /// the payment must not be reported as valid.
    ///
    /// # Errors
    ///
    /// [`VerifyError::ReplayedNonce`] if the pair was already spent, or
    /// [`VerifyError::Storage`] if the ledger could not be persisted.
    pub fn check_and_insert(
        &self,
        owner: &str,
        nonce: &str,
        timestamp: i64,
    ) -> std::result::Result<(), VerifyError> {
        let key = format!("{}:{nonce}", owner.to_lowercase());
        let mut inner = self.inner.lock();

        self.maybe_gc(&mut inner);

        if inner.nonces.contains_key(&key) {
            return Err(VerifyError::ReplayedNonce);
        }

        inner.nonces.insert(key.clone(), timestamp);
        if let Err(e) = self.persist(&inner) {
            inner.nonces.remove(&key);
            return Err(VerifyError::Storage(e));
        }
        Ok(())
    }

    /// Number of spent nonces currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().nonces.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().nonces.is_empty()
    }

    /// Drop nonces older than the retention window and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the pruned ledger cannot be persisted.
    pub fn gc(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let removed = Self::prune(&mut inner, self.retention);
        if removed > 0 {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    fn maybe_gc(&self, inner: &mut Inner) {
        let now = Utc::now().timestamp();
        let interval = self.retention.as_secs() as i64;
        if now - inner.last_gc < interval {
            return;
        }
        let removed = Self::prune(inner, self.retention);
        if removed > 0 {
            if let Err(e) = self.persist(inner) {
                warn!("Failed to persist nonce ledger after GC: {e}");
            }
        }
    }

    fn prune(inner: &mut Inner, retention: Duration) -> usize {
        let now = Utc::now().timestamp();
        let cutoff = now - retention.as_secs() as i64;
        let before = inner.nonces.len();
        inner.nonces.retain(|_, ts| *ts >= cutoff);
        inner.last_gc = now;
        let removed = before - inner.nonces.len();
        if removed > 0 {
            info!("Nonce GC removed {removed} expired nonces");
        }
        removed
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let content = serde_json::to_vec_pretty(&inner.nonces)?;
        atomic_write_bytes(&self.path, &content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> NonceLedger {
        NonceLedger::open(dir.path().join("nonces.json"), Duration::from_secs(3600))
            .expect("open ledger")
    }

    #[test]
    fn first_use_accepted_second_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        let now = Utc::now().timestamp();

        ledger.check_and_insert("payer-a", "n-1", now).expect("first use");
        assert!(matches!(
            ledger.check_and_insert("payer-a", "n-1", now),
            Err(VerifyError::ReplayedNonce)
        ));
        // Different payer, same nonce value: distinct pair.
        ledger.check_and_insert("payer-b", "n-1", now).expect("distinct pair");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nonces.json");
        let now = Utc::now().timestamp();
        {
            let ledger =
                NonceLedger::open(path.clone(), Duration::from_secs(3600)).expect("open");
            ledger.check_and_insert("payer-a", "n-1", now).expect("insert");
        }
        let reopened = NonceLedger::open(path, Duration::from_secs(3600)).expect("reopen");
        assert_eq!(reopened.len(), 1);
        assert!(matches!(
            reopened.check_and_insert("payer-a", "n-1", now),
            Err(VerifyError::ReplayedNonce)
        ));
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nonces.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(NonceLedger::open(path, Duration::from_secs(3600)).is_err());
    }

    #[test]
    fn gc_drops_only_expired() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        let now = Utc::now().timestamp();

        ledger
            .check_and_insert("payer-a", "old", now - 7200)
            .expect("old nonce");
        ledger.check_and_insert("payer-a", "new", now).expect("new nonce");

        let removed = ledger.gc().expect("gc");
        assert_eq!(removed, 1);
        assert_eq!(ledger.len(), 1);
        // The fresh nonce is still spent.
        assert!(matches!(
            ledger.check_and_insert("payer-a", "new", now),
            Err(VerifyError::ReplayedNonce)
        ));
    }

    #[test]
    fn concurrent_same_nonce_admits_exactly_one() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = std::sync::Arc::new(ledger(&dir));
        let now = Utc::now().timestamp();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = std::sync::Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger.check_and_insert("payer-a", "contested", now).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }
}
