//! apicover-node CLI entry point.

mod cli;

use apicover::external::{MockLedger, MockProver};
use apicover::{ServiceBuilder, ServiceEvent};
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("apicover-node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let reserve_units = cli.reserve_units;
    let config = cli.into_config()?;

    // In-process prover and ledger until real backends are wired up.
    let service = ServiceBuilder::new(config)
        .with_prover(Arc::new(MockProver::default()))
        .with_ledger(Arc::new(MockLedger::new(reserve_units)))
        .start()?;

    let mut events = service.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServiceEvent::ClaimPaid {
                    claim_id,
                    payout_units,
                    tx_ref,
                } => info!(%claim_id, payout_units, %tx_ref, "claim paid"),
                ServiceEvent::ReplayDetected { owner_identity } => {
                    warn!(%owner_identity, "payment replay detected");
                }
                ServiceEvent::Error { message } => warn!("service error: {message}"),
                _ => {}
            }
        }
    });

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.shutdown().await;
    event_task.abort();

    info!("Goodbye!");
    Ok(())
}
