//! Timing and synchronization engine for endurance race stations.
//!
//! Latchline runs at a timing station: a laptop at the start line, a
//! checkpoint in the hills, a finish gantry. Each station captures split
//! times offline-first, keeps its clock honest against a reference, and
//! reconciles with peer stations and the race-management service when
//! connectivity allows.
//!
//! # Features
//!
//! - **Non-blocking capture**: timestamps are taken before anything else
//!   runs; network and storage never delay the button press
//! - **Durability before visibility**: a result is journaled before any
//!   reader can see it
//! - **Clock trust**: captured times carry a measured reference offset
//!   and an explicit trust level
//! - **Idempotent delivery**: results reach the remote service exactly
//!   once, across retries, timeouts, and restarts
//! - **Station reconciliation**: peer stations merge event streams into
//!   one order, flagging ambiguous near-ties for operator review
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use latchline::{
//!     Bib, FileLog, RaceSession, ResultCategory, StationId, SystemTimeReference, TimingConfig,
//! };
//!
//! # async fn remote() -> Arc<dyn latchline::Remote> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let log = Arc::new(FileLog::open("finish-1.journal").await?);
//!     let session = RaceSession::open(
//!         StationId::new("finish-1"),
//!         TimingConfig::default(),
//!         log,
//!         Arc::new(SystemTimeReference),
//!         remote().await,
//!     )
//!     .await?;
//!
//!     // Button press: capture now, put the bib in later.
//!     let record = session.record_timed(None, ResultCategory::Finish).await?;
//!     let record = session.assign(record.id, Bib(42)).await?;
//!     session.submit(record.id).await?;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod config;
mod error;
pub mod types;

// Capture and trust
pub mod clock;
pub mod latch;

// Durable results and reconciliation
pub mod store;
pub mod sync;

// Delivery
pub mod stream;
pub mod submit;

// Operator-facing surface
pub mod import;
pub mod session;

// Core exports
pub use config::TimingConfig;
pub use error::{Result, TimingError};
pub use types::*;

// Component exports
pub use clock::{ClockProber, ClockTrust, SystemTimeReference, TimeReference, TrustSnapshot};
pub use import::{ImportSummary, import_roster};
pub use latch::Latch;
pub use session::RaceSession;
pub use store::{
    DurableLog, FileLog, MemoryLog, MergeOutcome, RecordFilter, RecordUpdate, ResultStore,
    UpdateKind,
};
pub use submit::{IdempotencyKey, Remote, ResultPayload, SubmissionPipeline, SubmitOutcome};
pub use sync::{MergeReport, PeerLink, StationSync};
