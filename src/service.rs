//! Service assembly and lifecycle.
//!
//! [`ServiceBuilder`] wires the store, nonce ledger, verifier, managers and
//! worker pool together from a [`ServiceConfig`]; [`RunningService`] owns the
//! background tasks and tears them down on shutdown.

use crate::claim::{
    default_failure_predicate, ClaimEngine, ClaimProcessor, FailurePredicate, WorkerPool,
};
use crate::config::{SchemeKind, ServiceConfig, StoreBackend};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, ServiceEvent, ServiceEventsChannel, ServiceEventsSender};
use crate::external::{LedgerClient, Prover};
use crate::payment::{
    EcdsaRecoverScheme, Ed25519Scheme, NonceLedger, PaymentVerifier, SignatureScheme,
};
use crate::policy::PolicyManager;
use crate::reserve::{ReserveMonitor, ReserveReport, ReserveStatus};
use crate::store::{EntityStore, FileStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Builds a [`RunningService`] from configuration and external clients.
pub struct ServiceBuilder {
    config: ServiceConfig,
    prover: Option<Arc<dyn Prover>>,
    ledger: Option<Arc<dyn LedgerClient>>,
    covered: FailurePredicate,
}

impl ServiceBuilder {
    /// Start building with `config`.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            prover: None,
            ledger: None,
            covered: default_failure_predicate(),
        }
    }

    /// Set the failure prover. Required.
    #[must_use]
    pub fn with_prover(mut self, prover: Arc<dyn Prover>) -> Self {
        self.prover = Some(prover);
        self
    }

    /// Set the settlement ledger. Required.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Replace the covered-failure rule.
    #[must_use]
    pub fn with_failure_predicate(mut self, covered: FailurePredicate) -> Self {
        self.covered = covered;
        self
    }

    /// Validate the configuration, open the stores and start the background
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a required client
    /// is missing, or the data directory cannot be opened.
    pub fn start(self) -> Result<RunningService> {
        let config = self.config;
        config.validate()?;
        let prover = self
            .prover
            .ok_or_else(|| Error::Config("a prover is required".to_string()))?;
        let ledger = self
            .ledger
            .ok_or_else(|| Error::Config("a ledger client is required".to_string()))?;

        std::fs::create_dir_all(&config.data_dir)?;
        let store: Arc<dyn EntityStore> = match config.store {
            StoreBackend::File => Arc::new(FileStore::open(config.data_dir.join("store"))?),
            StoreBackend::Sqlite => {
                Arc::new(SqliteStore::open(config.data_dir.join("apicover.db"))?)
            }
        };

        let nonces = Arc::new(NonceLedger::open(
            config.data_dir.join("nonces.json"),
            Duration::from_secs(config.payment.nonce_retention_secs),
        )?);
        let scheme: Box<dyn SignatureScheme> = match config.payment.scheme {
            SchemeKind::Ed25519 => Box::new(Ed25519Scheme),
            SchemeKind::Ecdsa => Box::new(EcdsaRecoverScheme),
        };
        let verifier = Arc::new(PaymentVerifier::new(
            scheme,
            nonces,
            config.payment.clone(),
        ));

        let (events, _) = create_event_channel();
        let policies = Arc::new(PolicyManager::new(store.clone(), config.cover.clone()));

        let (queue_tx, queue_rx) = mpsc::channel(config.claim_queue_depth);
        let claims = ClaimEngine::new(store.clone(), queue_tx, events.clone());
        let processor = Arc::new(ClaimProcessor::new(
            store.clone(),
            prover,
            ledger.clone(),
            self.covered,
            events.clone(),
        ));
        let workers = WorkerPool::spawn(processor, config.claim_workers, queue_rx);
        claims
            .recover()
            .map_err(|e| Error::Store(format!("claim recovery failed: {e}")))?;

        let reserve = Arc::new(ReserveMonitor::new(
            store.clone(),
            ledger,
            config.reserve.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reserve_task = spawn_reserve_loop(reserve.clone(), events.clone(), shutdown_rx);

        info!(
            backend = ?config.store,
            workers = config.claim_workers,
            "service started"
        );
        let _ = events.send(ServiceEvent::Started);

        Ok(RunningService {
            config,
            store,
            verifier,
            policies,
            claims,
            reserve,
            events,
            workers,
            reserve_task,
            shutdown_tx,
        })
    }
}

fn spawn_reserve_loop(
    monitor: Arc<ReserveMonitor>,
    events: ServiceEventsSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(monitor.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => match monitor.check().await {
                    Ok(report) => {
                        let _ = events.send(ServiceEvent::ReserveChecked {
                            status: report.status,
                            balance_units: report.balance_units,
                            outstanding_units: report.outstanding_units,
                        });
                    }
                    Err(e) => {
                        error!("reserve check failed: {e}");
                        let _ = events.send(ServiceEvent::Error {
                            message: format!("reserve check failed: {e}"),
                        });
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// A started service and its background tasks.
pub struct RunningService {
    config: ServiceConfig,
    store: Arc<dyn EntityStore>,
    verifier: Arc<PaymentVerifier>,
    policies: Arc<PolicyManager>,
    claims: ClaimEngine,
    reserve: Arc<ReserveMonitor>,
    events: ServiceEventsSender,
    workers: WorkerPool,
    reserve_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningService {
    /// The configuration the service was started with.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Subscribe to service events.
    #[must_use]
    pub fn subscribe(&self) -> ServiceEventsChannel {
        self.events.subscribe()
    }

    /// The payment verifier.
    #[must_use]
    pub fn verifier(&self) -> &PaymentVerifier {
        &self.verifier
    }

    /// The policy manager.
    #[must_use]
    pub fn policies(&self) -> &PolicyManager {
        &self.policies
    }

    /// The claim engine.
    #[must_use]
    pub fn claims(&self) -> &ClaimEngine {
        &self.claims
    }

    /// The reserve monitor.
    #[must_use]
    pub fn reserve(&self) -> &ReserveMonitor {
        &self.reserve
    }

    /// The entity store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn EntityStore> {
        self.store.clone()
    }

    /// Verify a payment authorization, reporting replays on the event bus.
    ///
    /// # Errors
    ///
    /// See [`crate::payment::VerifyError`].
    pub fn verify_payment(
        &self,
        auth: &crate::payment::PaymentAuthorization,
        required_units: u64,
    ) -> std::result::Result<crate::payment::VerifiedPayment, crate::payment::VerifyError> {
        let result = self.verifier.verify(auth, required_units);
        if matches!(result, Err(crate::payment::VerifyError::ReplayedNonce)) {
            let _ = self.events.send(ServiceEvent::ReplayDetected {
                owner_identity: auth.payer.to_lowercase(),
            });
        }
        result
    }

    /// Run one reserve check immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or store cannot be read.
    pub async fn check_reserve(&self) -> Result<ReserveReport> {
        let report = self
            .reserve
            .check()
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;
        if report.status == ReserveStatus::Critical {
            let _ = self.events.send(ServiceEvent::Error {
                message: "reserve is critical".to_string(),
            });
        }
        Ok(report)
    }

    /// Stop background tasks and drain the claim queue.
    ///
    /// Claims already accepted are processed to a terminal state before this
    /// returns; new submissions are rejected once the engine is dropped.
    pub async fn shutdown(self) {
        let _ = self.events.send(ServiceEvent::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.reserve_task.await {
            if !e.is_cancelled() {
                error!("reserve task panicked: {e}");
            }
        }
        // Dropping the engine closes the queue; workers drain what is left.
        drop(self.claims);
        self.workers.join().await;
        info!("service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{MockLedger, MockProver};
    use crate::model::ClaimEvidence;
    use crate::payment::PaymentAuthorization;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.payment.recipient = "backend".to_string();
        config.payment.asset = "usdc-mint".to_string();
        config.reserve.check_interval_secs = 3600;
        config
    }

    fn start(dir: &TempDir, balance: u64) -> RunningService {
        ServiceBuilder::new(test_config(dir))
            .with_prover(Arc::new(MockProver::default()))
            .with_ledger(Arc::new(MockLedger::new(balance)))
            .start()
            .expect("service starts")
    }

    fn signed_auth(key: &SigningKey, amount_units: u64, nonce: &str) -> PaymentAuthorization {
        let mut auth = PaymentAuthorization {
            payer: hex::encode(key.verifying_key().to_bytes()),
            amount_units,
            asset: "usdc-mint".to_string(),
            pay_to: "backend".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: nonce.to_string(),
            signature: String::new(),
        };
        auth.signature = hex::encode(key.sign(&auth.canonical_json()).to_bytes());
        auth
    }

    #[tokio::test]
    async fn starts_emits_started_and_shuts_down() {
        let dir = TempDir::new().expect("tempdir");
        let service = start(&dir, 1_000_000);
        let mut events = service.subscribe();
        service.shutdown().await;
        // Subscription was created after Started; ShuttingDown is the first
        // event it observes.
        assert!(matches!(
            events.recv().await,
            Ok(ServiceEvent::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn requires_prover_and_ledger() {
        let dir = TempDir::new().expect("tempdir");
        let result = ServiceBuilder::new(test_config(&dir))
            .with_ledger(Arc::new(MockLedger::new(0)))
            .start();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn end_to_end_policy_and_claim_through_service() {
        let dir = TempDir::new().expect("tempdir");
        let service = start(&dir, 1_000_000);
        let key = SigningKey::generate(&mut OsRng);

        let premium = service.policies().premium_for(10_000).expect("premium");
        let auth = signed_auth(&key, premium, "n-1");
        let payment = service.verifier().verify(&auth, premium).expect("payment");
        let policy = service
            .policies()
            .issue(&payment, 10_000, "https://api.example.com")
            .expect("issue");

        let claim = service
            .claims()
            .submit(
                policy.policy_id,
                ClaimEvidence {
                    status_code: 500,
                    body_len: 0,
                    body_hash: "00".repeat(32),
                    headers_hash: "11".repeat(32),
                },
                None,
            )
            .expect("submit");

        // Shutdown drains the queue, so the claim is terminal afterwards.
        let store = service.store();
        service.shutdown().await;
        let stored = store.get_claim(claim.claim_id).expect("get").expect("exists");
        assert_eq!(stored.status, crate::model::ClaimStatus::Paid);
        assert_eq!(stored.payout_units, Some(10_000));
    }

    #[tokio::test]
    async fn recovers_queued_claims_across_restart() {
        let dir = TempDir::new().expect("tempdir");
        let key = SigningKey::generate(&mut OsRng);
        let claim_id;
        {
            let service = start(&dir, 1_000_000);
            let premium = service.policies().premium_for(10_000).expect("premium");
            let auth = signed_auth(&key, premium, "n-1");
            let payment = service.verifier().verify(&auth, premium).expect("payment");
            let policy = service
                .policies()
                .issue(&payment, 10_000, "t")
                .expect("issue");

            // Park the claim as unfinished work directly in the store, as if
            // the process died before a worker picked it up.
            let claim = service
                .claims()
                .submit(
                    policy.policy_id,
                    ClaimEvidence {
                        status_code: 503,
                        body_len: 0,
                        body_hash: "00".repeat(32),
                        headers_hash: "11".repeat(32),
                    },
                    None,
                )
                .expect("submit");
            claim_id = claim.claim_id;
            service.shutdown().await;
        }

        let service = start(&dir, 1_000_000);
        let store = service.store();
        service.shutdown().await;
        let stored = store.get_claim(claim_id).expect("get").expect("exists");
        assert!(stored.status.is_terminal());
    }
}
