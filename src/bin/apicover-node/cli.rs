//! Command-line interface definition.

use apicover::config::{SchemeKind, ServiceConfig, StoreBackend};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Micropayment-backed outage cover service for HTTP APIs.
#[derive(Parser, Debug)]
#[command(name = "apicover-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for service data.
    #[arg(long, env = "APICOVER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Entity store backend.
    #[arg(long, value_enum, default_value = "file", env = "APICOVER_STORE")]
    pub store: CliStoreBackend,

    /// Number of claim-processing workers.
    #[arg(long, default_value = "2", env = "APICOVER_CLAIM_WORKERS")]
    pub claim_workers: usize,

    /// Identity premium payments must name as recipient.
    #[arg(long, env = "APICOVER_RECIPIENT")]
    pub recipient: Option<String>,

    /// Settlement asset payments must name (empty to accept any).
    #[arg(long, env = "APICOVER_ASSET")]
    pub asset: Option<String>,

    /// Payment authorization signature scheme.
    #[arg(long, value_enum, default_value = "ed25519", env = "APICOVER_SCHEME")]
    pub scheme: CliScheme,

    /// Starting reserve balance in micro-units (mock ledger).
    #[arg(long, default_value = "10000000", env = "APICOVER_RESERVE_UNITS")]
    pub reserve_units: u64,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Store backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStoreBackend {
    /// Flat JSON files.
    File,
    /// SQLite database.
    Sqlite,
}

/// Signature scheme CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliScheme {
    /// EdDSA over canonical JSON.
    Ed25519,
    /// ECDSA with public-key recovery.
    Ecdsa,
}

impl Cli {
    /// Convert CLI arguments into a ServiceConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<ServiceConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            ServiceConfig::from_file(path)?
        } else {
            ServiceConfig::default()
        };

        // Override with CLI arguments
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(recipient) = self.recipient {
            config.payment.recipient = recipient;
        }
        if let Some(asset) = self.asset {
            config.payment.asset = asset;
        }

        config.store = self.store.into();
        config.payment.scheme = self.scheme.into();
        config.claim_workers = self.claim_workers;
        config.log_level = self.log_level;

        config.validate()?;
        Ok(config)
    }
}

impl From<CliStoreBackend> for StoreBackend {
    fn from(b: CliStoreBackend) -> Self {
        match b {
            CliStoreBackend::File => StoreBackend::File,
            CliStoreBackend::Sqlite => StoreBackend::Sqlite,
        }
    }
}

impl From<CliScheme> for SchemeKind {
    fn from(s: CliScheme) -> Self {
        match s {
            CliScheme::Ed25519 => SchemeKind::Ed25519,
            CliScheme::Ecdsa => SchemeKind::Ecdsa,
        }
    }
}
