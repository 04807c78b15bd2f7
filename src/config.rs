//! Configuration for the apicover service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Entity store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Lock-file protected flat JSON store.
    #[default]
    File,
    /// SQLite relational store.
    Sqlite,
}

/// Payment authorization signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeKind {
    /// EdDSA over canonical JSON (ed25519).
    #[default]
    Ed25519,
    /// ECDSA with public-key recovery over a structured message (secp256k1).
    Ecdsa,
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory for service data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Entity store backend.
    #[serde(default)]
    pub store: StoreBackend,

    /// Number of claim-processing workers.
    #[serde(default = "default_workers")]
    pub claim_workers: usize,

    /// Claim queue capacity. Submissions beyond this are rejected until the
    /// workers catch up.
    #[serde(default = "default_queue_depth")]
    pub claim_queue_depth: usize,

    /// Payment verification settings.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Cover terms.
    #[serde(default)]
    pub cover: CoverConfig,

    /// Reserve monitoring settings.
    #[serde(default)]
    pub reserve: ReserveConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Payment verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Identity that premium payments must name as recipient.
    #[serde(default)]
    pub recipient: String,

    /// Settlement asset identifier payments must name.
    #[serde(default)]
    pub asset: String,

    /// Signature scheme for payment authorizations.
    #[serde(default)]
    pub scheme: SchemeKind,

    /// Maximum accepted authorization age in seconds.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Tolerated forward clock skew in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Nonce retention in seconds. Must exceed `max_age_secs +
    /// clock_skew_secs` or a replayed authorization could slip through after
    /// garbage collection.
    #[serde(default = "default_nonce_retention")]
    pub nonce_retention_secs: u64,
}

/// Cover terms configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverConfig {
    /// Premium rate in basis points of coverage (100 = 1%).
    #[serde(default = "default_premium_rate_bps")]
    pub premium_rate_bps: u32,

    /// Minimum coverage per policy, in micro-units.
    #[serde(default = "default_min_coverage")]
    pub min_coverage_units: u64,

    /// Maximum coverage per policy, in micro-units.
    #[serde(default = "default_max_coverage")]
    pub max_coverage_units: u64,

    /// Policy duration in hours.
    #[serde(default = "default_policy_duration")]
    pub policy_duration_hours: u64,

    /// Maximum renewal extension in hours (7 days).
    #[serde(default = "default_max_renewal")]
    pub max_renewal_hours: u64,
}

/// Reserve monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveConfig {
    /// Minimum ratio of reserve balance to outstanding coverage.
    #[serde(default = "default_min_reserve_ratio")]
    pub min_ratio: f64,

    /// Check interval in seconds.
    #[serde(default = "default_reserve_interval")]
    pub check_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreBackend::default(),
            claim_workers: default_workers(),
            claim_queue_depth: default_queue_depth(),
            payment: PaymentConfig::default(),
            cover: CoverConfig::default(),
            reserve: ReserveConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            asset: String::new(),
            scheme: SchemeKind::default(),
            max_age_secs: default_max_age(),
            clock_skew_secs: default_clock_skew(),
            nonce_retention_secs: default_nonce_retention(),
        }
    }
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            premium_rate_bps: default_premium_rate_bps(),
            min_coverage_units: default_min_coverage(),
            max_coverage_units: default_max_coverage(),
            policy_duration_hours: default_policy_duration(),
            max_renewal_hours: default_max_renewal(),
        }
    }
}

impl Default for ReserveConfig {
    fn default() -> Self {
        Self {
            min_ratio: default_min_reserve_ratio(),
            check_interval_secs: default_reserve_interval(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "apicover")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".apicover"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_workers() -> usize {
    2
}

const fn default_queue_depth() -> usize {
    1024
}

const fn default_max_age() -> u64 {
    300 // 5 minutes
}

const fn default_clock_skew() -> u64 {
    60
}

const fn default_nonce_retention() -> u64 {
    3600 // 1 hour
}

const fn default_premium_rate_bps() -> u32 {
    100 // 1%
}

const fn default_min_coverage() -> u64 {
    1_000 // 0.001 in micro-units
}

const fn default_max_coverage() -> u64 {
    100_000 // 0.1 in micro-units
}

const fn default_policy_duration() -> u64 {
    24
}

const fn default_max_renewal() -> u64 {
    168
}

const fn default_min_reserve_ratio() -> f64 {
    1.5
}

const fn default_reserve_interval() -> u64 {
    300
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is internally inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cover.min_coverage_units > self.cover.max_coverage_units {
            return Err(crate::Error::Config(format!(
                "min_coverage_units {} exceeds max_coverage_units {}",
                self.cover.min_coverage_units, self.cover.max_coverage_units
            )));
        }
        if self.payment.nonce_retention_secs
            <= self.payment.max_age_secs + self.payment.clock_skew_secs
        {
            return Err(crate::Error::Config(format!(
                "nonce_retention_secs {} must exceed max_age_secs + clock_skew_secs ({})",
                self.payment.nonce_retention_secs,
                self.payment.max_age_secs + self.payment.clock_skew_secs
            )));
        }
        if self.claim_workers == 0 {
            return Err(crate::Error::Config(
                "claim_workers must be at least 1".to_string(),
            ));
        }
        if self.claim_queue_depth == 0 {
            return Err(crate::Error::Config(
                "claim_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.reserve.min_ratio < 1.0 {
            return Err(crate::Error::Config(format!(
                "reserve min_ratio {} must be at least 1.0",
                self.reserve.min_ratio
            )));
        }
        Ok(())
    }
}
