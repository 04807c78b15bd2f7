//! apicover - micropayment API-outage cover service.
//!
//! Issues short-lived cover policies to automated callers after verifying a
//! signed payment authorization, and settles claims against those policies
//! when a covered endpoint fails. Claims are proven by an external prover and
//! paid out from a settlement reserve through an external ledger client.
//!
//! # Architecture
//!
//! ```text
//! payment authorization
//!        │
//!        ▼
//! ┌──────────────────┐    ┌────────────────┐
//! │ PaymentVerifier  │───▶│ PolicyManager  │──▶ EntityStore (Policy)
//! │  + NonceLedger   │    └────────────────┘
//! └──────────────────┘
//!
//! claim request
//!        │
//!        ▼
//! ┌──────────────────┐   enqueue   ┌──────────────┐
//! │   ClaimEngine    │────────────▶│ worker pool  │──▶ Prover ──▶ Ledger
//! └──────────────────┘             └──────────────┘        │
//!        │                                                 ▼
//!        └──────────────▶ EntityStore (Claim) ◀── finalized state
//!
//! ReserveMonitor: ledger balance vs. outstanding coverage, on an interval.
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod claim;
pub mod config;
pub mod error;
pub mod event;
pub mod external;
pub mod model;
pub mod payment;
pub mod policy;
pub mod reserve;
pub mod service;
pub mod store;

pub use claim::{ClaimEngine, ClaimError};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use event::{create_event_channel, ServiceEvent, ServiceEventsChannel, ServiceEventsSender};
pub use model::{Claim, ClaimStatus, Policy, PolicyStatus};
pub use payment::{NonceLedger, PaymentVerifier, VerifiedPayment, VerifyError};
pub use policy::{PolicyError, PolicyManager};
pub use reserve::{ReserveMonitor, ReserveReport, ReserveStatus};
pub use service::{RunningService, ServiceBuilder};
pub use store::{EntityStore, FileStore, SqliteStore, UpdateOutcome};
