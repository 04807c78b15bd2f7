//! End-to-end policy and claim lifecycle tests against a running service
//! with in-process prover and ledger.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use apicover::external::{MockLedger, MockProver};
use apicover::model::ClaimEvidence;
use apicover::payment::{PaymentAuthorization, VerifyError};
use apicover::{
    ClaimError, ClaimStatus, EntityStore, PolicyStatus, RunningService, ServiceBuilder,
    ServiceConfig, ServiceEvent,
};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

struct TestRig {
    service: RunningService,
    prover: Arc<MockProver>,
    ledger: Arc<MockLedger>,
    key: SigningKey,
    _dir: TempDir,
}

fn rig(reserve_units: u64) -> TestRig {
    let dir = TempDir::new().expect("tempdir");
    let mut config = ServiceConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.payment.recipient = "backend".to_string();
    config.payment.asset = "usdc-mint".to_string();
    config.reserve.check_interval_secs = 3600;

    let prover = Arc::new(MockProver::default());
    let ledger = Arc::new(MockLedger::new(reserve_units));
    let service = ServiceBuilder::new(config)
        .with_prover(prover.clone())
        .with_ledger(ledger.clone())
        .start()
        .expect("service starts");
    TestRig {
        service,
        prover,
        ledger,
        key: SigningKey::generate(&mut OsRng),
        _dir: dir,
    }
}

impl TestRig {
    fn auth(&self, amount_units: u64) -> PaymentAuthorization {
        let mut auth = PaymentAuthorization {
            payer: hex::encode(self.key.verifying_key().to_bytes()),
            amount_units,
            asset: "usdc-mint".to_string(),
            pay_to: "backend".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: Uuid::new_v4().to_string(),
            signature: String::new(),
        };
        auth.signature = hex::encode(self.key.sign(&auth.canonical_json()).to_bytes());
        auth
    }

    fn issue_policy(&self, coverage_units: u64) -> apicover::Policy {
        let premium = self
            .service
            .policies()
            .premium_for(coverage_units)
            .expect("premium");
        let payment = self
            .service
            .verify_payment(&self.auth(premium), premium)
            .expect("payment verifies");
        self.service
            .policies()
            .issue(&payment, coverage_units, "https://api.example.com/v1/data")
            .expect("policy issues")
    }

    /// Wait for the claim to reach a terminal state via the event bus.
    async fn await_terminal(
        &self,
        events: &mut apicover::ServiceEventsChannel,
        claim_id: Uuid,
    ) -> ServiceEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.expect("event stream open") {
                    event @ (ServiceEvent::ClaimPaid { claim_id: id, .. }
                    | ServiceEvent::ClaimRejected { claim_id: id, .. }
                    | ServiceEvent::ClaimFailed { claim_id: id, .. })
                        if id == claim_id =>
                    {
                        return event;
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("claim reached a terminal state")
    }
}

fn outage_evidence() -> ClaimEvidence {
    ClaimEvidence {
        status_code: 503,
        body_len: 0,
        body_hash: "aa".repeat(32),
        headers_hash: "bb".repeat(32),
    }
}

fn healthy_evidence() -> ClaimEvidence {
    ClaimEvidence {
        status_code: 200,
        body_len: 128,
        body_hash: "cc".repeat(32),
        headers_hash: "dd".repeat(32),
    }
}

// Happy path: premium buys a policy, an outage claim pays out the full
// coverage and closes the policy.
#[tokio::test]
async fn outage_claim_pays_out_and_closes_policy() {
    let rig = rig(1_000_000);
    let mut events = rig.service.subscribe();
    let policy = rig.issue_policy(10_000);
    assert_eq!(policy.status, PolicyStatus::Active);
    assert_eq!(policy.premium_units, 100);

    let claim = rig
        .service
        .claims()
        .submit(policy.policy_id, outage_evidence(), None)
        .expect("claim accepted");
    let event = rig.await_terminal(&mut events, claim.claim_id).await;
    assert!(matches!(
        event,
        ServiceEvent::ClaimPaid { payout_units: 10_000, .. }
    ));

    let store = rig.service.store();
    let paid = store.get_claim(claim.claim_id).unwrap().unwrap();
    assert_eq!(paid.status, ClaimStatus::Paid);
    assert_eq!(paid.payout_units, Some(10_000));
    assert!(paid.settlement_tx_ref.is_some());
    assert!(paid.reason.is_some());

    let closed = store.get_policy(policy.policy_id).unwrap().unwrap();
    assert_eq!(closed.status, PolicyStatus::Claimed);
    assert_eq!(closed.pending_claim, None);

    // Exactly one transfer, to the policy owner, for the coverage amount.
    let owner = hex::encode(rig.key.verifying_key().to_bytes());
    assert_eq!(rig.ledger.transfers(), vec![(owner, 10_000)]);
}

// A healthy response is not a covered failure: the claim is rejected and the
// policy stays open for a genuine outage later.
#[tokio::test]
async fn healthy_evidence_rejected_policy_stays_open() {
    let rig = rig(1_000_000);
    let mut events = rig.service.subscribe();
    let policy = rig.issue_policy(10_000);

    let claim = rig
        .service
        .claims()
        .submit(policy.policy_id, healthy_evidence(), None)
        .expect("claim accepted");
    let event = rig.await_terminal(&mut events, claim.claim_id).await;
    assert!(matches!(event, ServiceEvent::ClaimRejected { .. }));
    assert!(rig.ledger.transfers().is_empty());

    let store = rig.service.store();
    let open = store.get_policy(policy.policy_id).unwrap().unwrap();
    assert_eq!(open.status, PolicyStatus::Active);
    assert_eq!(open.pending_claim, None);

    // The real outage still pays.
    let claim = rig
        .service
        .claims()
        .submit(policy.policy_id, outage_evidence(), None)
        .expect("second claim accepted");
    let event = rig.await_terminal(&mut events, claim.claim_id).await;
    assert!(matches!(event, ServiceEvent::ClaimPaid { .. }));
}

// Downstream failure leaves the claim retryable: resubmitting the same
// idempotency key re-runs the same claim record and settles exactly once.
#[tokio::test]
async fn failed_claim_retries_with_same_key_and_settles_once() {
    let rig = rig(1_000_000);
    let mut events = rig.service.subscribe();
    let policy = rig.issue_policy(10_000);

    rig.prover.fail_next();
    let claim = rig
        .service
        .claims()
        .submit(policy.policy_id, outage_evidence(), Some("key-1".to_string()))
        .expect("claim accepted");
    let event = rig.await_terminal(&mut events, claim.claim_id).await;
    assert!(matches!(event, ServiceEvent::ClaimFailed { .. }));
    assert!(rig.ledger.transfers().is_empty());

    let retried = rig
        .service
        .claims()
        .submit(policy.policy_id, outage_evidence(), Some("key-1".to_string()))
        .expect("resubmission accepted");
    assert_eq!(retried.claim_id, claim.claim_id);

    let event = rig.await_terminal(&mut events, claim.claim_id).await;
    assert!(matches!(event, ServiceEvent::ClaimPaid { .. }));
    assert_eq!(rig.ledger.transfers().len(), 1);
}

// Replaying a spent authorization is rejected and reported as an attack.
#[tokio::test]
async fn replayed_authorization_rejected_and_reported() {
    let rig = rig(1_000_000);
    let mut events = rig.service.subscribe();

    let premium = rig.service.policies().premium_for(10_000).expect("premium");
    let auth = rig.auth(premium);
    rig.service
        .verify_payment(&auth, premium)
        .expect("first use verifies");
    assert!(matches!(
        rig.service.verify_payment(&auth, premium),
        Err(VerifyError::ReplayedNonce)
    ));

    let replay = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(ServiceEvent::ReplayDetected { owner_identity }) = events.recv().await {
                return owner_identity;
            }
        }
    })
    .await
    .expect("replay reported");
    assert_eq!(replay, hex::encode(rig.key.verifying_key().to_bytes()));
}

// At most one claim per policy may be in flight, and a paid policy accepts
// no further claims.
#[tokio::test]
async fn policy_exclusivity_and_single_payout() {
    let rig = rig(1_000_000);
    let mut events = rig.service.subscribe();
    let policy = rig.issue_policy(10_000);

    let first = rig
        .service
        .claims()
        .submit(policy.policy_id, outage_evidence(), Some("k-1".to_string()))
        .expect("first accepted");
    // While the first claim is queued or processing, a second one with a
    // different key is turned away.
    let second = rig.service.claims().submit(
        policy.policy_id,
        healthy_evidence(),
        Some("k-2".to_string()),
    );
    assert!(matches!(second, Err(ClaimError::PolicyAlreadyClaimed)));

    let event = rig.await_terminal(&mut events, first.claim_id).await;
    assert!(matches!(event, ServiceEvent::ClaimPaid { .. }));

    // Paid policy: further claims are rejected outright.
    assert!(matches!(
        rig.service.claims().submit(
            policy.policy_id,
            outage_evidence(),
            Some("k-3".to_string())
        ),
        Err(ClaimError::PolicyAlreadyClaimed)
    ));
    assert_eq!(rig.ledger.transfers().len(), 1);
}

// Renewal extends the expiry pro-rata and only for the owner.
#[tokio::test]
async fn renewal_extends_coverage_for_fee() {
    let rig = rig(1_000_000);
    let policy = rig.issue_policy(10_000);

    let fee = rig
        .service
        .policies()
        .renewal_fee_for(10_000, 48)
        .expect("fee");
    assert_eq!(fee, 200); // two full premiums for two extra days

    let payment = rig
        .service
        .verify_payment(&rig.auth(fee), fee)
        .expect("fee payment");
    let renewed = rig
        .service
        .policies()
        .renew(policy.policy_id, &payment, 48)
        .expect("renewal");
    assert_eq!(
        renewed.expires_at - policy.expires_at,
        chrono::Duration::hours(48)
    );
    assert_eq!(renewed.renewal_count, 1);
    assert_eq!(renewed.total_renewal_fee_units, fee);
}

// Reserve health reflects the ledger balance against open coverage.
#[tokio::test]
async fn reserve_health_tracks_outstanding_coverage() {
    let rig = rig(12_000);
    let report = rig.service.check_reserve().await.expect("check");
    assert_eq!(report.status, apicover::ReserveStatus::Healthy);
    assert_eq!(report.outstanding_units, 0);

    // 10_000 outstanding against 12_000 balance is below the 1.5x target.
    rig.issue_policy(10_000);
    let report = rig.service.check_reserve().await.expect("check");
    assert_eq!(report.status, apicover::ReserveStatus::Warning);
    assert_eq!(report.outstanding_units, 10_000);
    assert_eq!(report.active_policies, 1);
}

// Policies, claims and spent nonces survive a restart.
#[tokio::test]
async fn state_survives_restart() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = ServiceConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.payment.recipient = "backend".to_string();
    config.reserve.check_interval_secs = 3600;

    let key = SigningKey::generate(&mut OsRng);
    let sign = |amount: u64, nonce: &str| {
        let mut auth = PaymentAuthorization {
            payer: hex::encode(key.verifying_key().to_bytes()),
            amount_units: amount,
            asset: "usdc-mint".to_string(),
            pay_to: "backend".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: nonce.to_string(),
            signature: String::new(),
        };
        auth.signature = hex::encode(key.sign(&auth.canonical_json()).to_bytes());
        auth
    };

    let policy_id;
    {
        let service = ServiceBuilder::new(config.clone())
            .with_prover(Arc::new(MockProver::default()))
            .with_ledger(Arc::new(MockLedger::new(1_000_000)))
            .start()
            .expect("first start");
        let payment = service
            .verify_payment(&sign(100, "nonce-1"), 100)
            .expect("payment");
        policy_id = service
            .policies()
            .issue(&payment, 10_000, "t")
            .expect("issue")
            .policy_id;
        service.shutdown().await;
    }

    let service = ServiceBuilder::new(config)
        .with_prover(Arc::new(MockProver::default()))
        .with_ledger(Arc::new(MockLedger::new(1_000_000)))
        .start()
        .expect("second start");

    let store = service.store();
    let policy = store.get_policy(policy_id).unwrap().unwrap();
    assert_eq!(policy.status, PolicyStatus::Active);

    // The nonce ledger is durable too: the old authorization stays spent.
    assert!(matches!(
        service.verify_payment(&sign(100, "nonce-1"), 100),
        Err(VerifyError::ReplayedNonce)
    ));
    service.shutdown().await;
}
