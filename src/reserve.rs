//! Reserve health accounting.
//!
//! Outstanding coverage is the sum over active, unexpired policies of their
//! coverage amounts; the reserve is the ledger balance backing payouts. The
//! monitor compares the two against the configured minimum ratio.

use crate::config::ReserveConfig;
use crate::external::LedgerClient;
use crate::model::PolicyStatus;
use crate::store::EntityStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Reserve health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReserveStatus {
    /// Balance covers outstanding coverage at the configured ratio.
    Healthy,
    /// Balance covers outstanding coverage but below the configured ratio.
    Warning,
    /// Balance cannot cover outstanding coverage.
    Critical,
}

impl std::fmt::Display for ReserveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveStatus::Healthy => write!(f, "healthy"),
            ReserveStatus::Warning => write!(f, "warning"),
            ReserveStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot produced by a reserve check.
#[derive(Debug, Clone, Serialize)]
pub struct ReserveReport {
    /// Health classification.
    pub status: ReserveStatus,
    /// Ledger balance in micro-units.
    pub balance_units: u64,
    /// Sum of active, unexpired coverage in micro-units.
    pub outstanding_units: u64,
    /// Number of policies contributing to the outstanding total.
    pub active_policies: usize,
    /// Configured minimum balance-to-outstanding ratio.
    pub min_ratio: f64,
}

/// Reserve check failure.
#[derive(Debug, Error)]
pub enum ReserveError {
    /// The ledger balance could not be read.
    #[error("ledger: {0}")]
    Ledger(#[from] crate::external::LedgerError),
    /// The store could not be read.
    #[error(transparent)]
    Store(#[from] crate::Error),
}

/// Periodically compares the reserve balance to outstanding coverage.
pub struct ReserveMonitor {
    store: Arc<dyn EntityStore>,
    ledger: Arc<dyn LedgerClient>,
    config: ReserveConfig,
}

impl ReserveMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        ledger: Arc<dyn LedgerClient>,
        config: ReserveConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Run one reserve check.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or store cannot be read.
    pub async fn check(&self) -> Result<ReserveReport, ReserveError> {
        let balance_units = self.ledger.balance().await?;

        let now = Utc::now();
        let mut outstanding_units: u64 = 0;
        let mut active_policies = 0;
        for policy in self.store.all_policies()? {
            if policy.status == PolicyStatus::Active && !policy.is_expired(now) {
                outstanding_units = outstanding_units.saturating_add(policy.coverage_units);
                active_policies += 1;
            }
        }

        let status = classify(balance_units, outstanding_units, self.config.min_ratio);
        let report = ReserveReport {
            status,
            balance_units,
            outstanding_units,
            active_policies,
            min_ratio: self.config.min_ratio,
        };
        match status {
            ReserveStatus::Healthy => info!(
                balance_units,
                outstanding_units, active_policies, "reserve check: healthy"
            ),
            ReserveStatus::Warning => warn!(
                balance_units,
                outstanding_units, "reserve below target ratio {}", self.config.min_ratio
            ),
            ReserveStatus::Critical => warn!(
                balance_units,
                outstanding_units, "reserve cannot cover outstanding coverage"
            ),
        }
        Ok(report)
    }

    /// Whether issuing `coverage_units` of new coverage would keep the
    /// reserve at or above the minimum ratio.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or store cannot be read.
    pub async fn can_cover(&self, coverage_units: u64) -> Result<bool, ReserveError> {
        let report = self.check().await?;
        let projected = report.outstanding_units.saturating_add(coverage_units);
        Ok(classify(report.balance_units, projected, self.config.min_ratio)
            == ReserveStatus::Healthy)
    }

    /// Configured check interval.
    #[must_use]
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.check_interval_secs)
    }
}

#[allow(clippy::cast_precision_loss)]
fn classify(balance_units: u64, outstanding_units: u64, min_ratio: f64) -> ReserveStatus {
    if outstanding_units == 0 {
        return ReserveStatus::Healthy;
    }
    let balance = balance_units as f64;
    let outstanding = outstanding_units as f64;
    if balance >= outstanding * min_ratio {
        ReserveStatus::Healthy
    } else if balance_units >= outstanding_units {
        ReserveStatus::Warning
    } else {
        ReserveStatus::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::MockLedger;
    use crate::model::{Policy, RECORD_VERSION};
    use crate::store::FileStore;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn policy(coverage: u64, status: PolicyStatus, expired: bool) -> Policy {
        let now = Utc::now();
        let expires_at = if expired {
            now - chrono::Duration::hours(1)
        } else {
            now + chrono::Duration::hours(24)
        };
        Policy {
            record_version: RECORD_VERSION,
            policy_id: Uuid::new_v4(),
            owner_identity: "payer-a".to_string(),
            target_hash: "cd".repeat(32),
            coverage_units: coverage,
            premium_units: coverage / 100,
            status,
            pending_claim: None,
            created_at: now,
            expires_at,
            renewal_count: 0,
            total_renewal_fee_units: 0,
        }
    }

    fn monitor(dir: &TempDir, balance: u64) -> (ReserveMonitor, Arc<FileStore>) {
        let store = Arc::new(FileStore::open(dir.path()).expect("open store"));
        let ledger = Arc::new(MockLedger::new(balance));
        let monitor = ReserveMonitor::new(store.clone(), ledger, ReserveConfig::default());
        (monitor, store)
    }

    #[tokio::test]
    async fn empty_book_is_healthy_at_any_balance() {
        let dir = TempDir::new().expect("tempdir");
        let (monitor, _store) = monitor(&dir, 0);
        let report = monitor.check().await.expect("check");
        assert_eq!(report.status, ReserveStatus::Healthy);
        assert_eq!(report.outstanding_units, 0);
    }

    #[tokio::test]
    async fn classification_thresholds() {
        let dir = TempDir::new().expect("tempdir");
        // Outstanding 10_000 at ratio 1.5 needs 15_000 to be healthy.
        let (monitor, store) = monitor(&dir, 15_000);
        store
            .create_policy(&policy(10_000, PolicyStatus::Active, false))
            .expect("create");
        assert_eq!(
            monitor.check().await.expect("check").status,
            ReserveStatus::Healthy
        );

        let dir = TempDir::new().expect("tempdir");
        let (monitor, store) = self::monitor(&dir, 12_000);
        store
            .create_policy(&policy(10_000, PolicyStatus::Active, false))
            .expect("create");
        assert_eq!(
            monitor.check().await.expect("check").status,
            ReserveStatus::Warning
        );

        let dir = TempDir::new().expect("tempdir");
        let (monitor, store) = self::monitor(&dir, 9_999);
        store
            .create_policy(&policy(10_000, PolicyStatus::Active, false))
            .expect("create");
        assert_eq!(
            monitor.check().await.expect("check").status,
            ReserveStatus::Critical
        );
    }

    #[tokio::test]
    async fn only_active_unexpired_policies_count() {
        let dir = TempDir::new().expect("tempdir");
        let (monitor, store) = monitor(&dir, 100_000);
        store
            .create_policy(&policy(10_000, PolicyStatus::Active, false))
            .expect("create");
        store
            .create_policy(&policy(20_000, PolicyStatus::Claimed, false))
            .expect("create");
        store
            .create_policy(&policy(40_000, PolicyStatus::Active, true))
            .expect("create");

        let report = monitor.check().await.expect("check");
        assert_eq!(report.outstanding_units, 10_000);
        assert_eq!(report.active_policies, 1);
    }

    #[tokio::test]
    async fn can_cover_projects_new_coverage() {
        let dir = TempDir::new().expect("tempdir");
        let (monitor, store) = monitor(&dir, 30_000);
        store
            .create_policy(&policy(10_000, PolicyStatus::Active, false))
            .expect("create");

        // 30_000 covers 10_000 + 10_000 at ratio 1.5 exactly.
        assert!(monitor.can_cover(10_000).await.expect("check"));
        assert!(!monitor.can_cover(10_001).await.expect("check"));
    }
}
