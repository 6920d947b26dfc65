//! Error types for the timing engine.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. The taxonomy mirrors the engine's failure domains:
//!
//! - **Clock errors**: the reference clock is unreachable or drifting
//! - **Conflict errors**: a commit would violate result uniqueness
//! - **Submission errors**: transient (retried) vs. permanent (surfaced)
//! - **Sync errors**: a peer station cannot be reached this cycle
//! - **Storage errors**: the durable log failed an append or replay
//!
//! Errors local to one subsystem never halt the others: a submission
//! failure must not block capture, and a clock-sync failure must not block
//! commit. A captured timing event, once committed, is never discarded.
//!
//! ## Retry classification
//!
//! ```rust
//! use latchline::TimingError;
//!
//! let error = TimingError::transient_submission("connection reset");
//! assert!(error.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::types::{Bib, RecordId, ResultCategory, StationId};

/// Result type alias for timing operations.
pub type Result<T, E = TimingError> = std::result::Result<T, E>;

/// Main error type for timing operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TimingError {
    /// The local clock cannot currently be trusted against the reference.
    ///
    /// Warning-grade: capture continues with `Unsynced` trust. Surfaced so
    /// operators know results will need a correction pass.
    #[error("clock untrusted: {reason}")]
    ClockUntrusted { reason: String },

    /// A commit would create a second active result for the same racer and
    /// category without a supersede reference. Requires explicit operator
    /// resolution; never resolved silently.
    #[error("conflicting result for bib {bib} in {category}: record {existing} is already active")]
    Conflict { bib: Bib, category: ResultCategory, existing: RecordId },

    /// The remote service could not be reached or answered with a
    /// retryable failure. The pipeline retries with backoff.
    #[error("transient submission failure: {reason}")]
    TransientSubmission {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The remote service explicitly rejected the payload. Not retried;
    /// surfaced for manual resubmission.
    #[error("submission rejected by remote: {reason}")]
    PermanentSubmission { reason: String },

    /// A peer station could not be reached during a reconciliation cycle.
    /// Deferred and retried on the next cycle.
    #[error("station {peer} unreachable: {reason}")]
    SyncUnreachable { peer: StationId, reason: String },

    /// The durable log failed. Commits are not confirmed until the append
    /// succeeds, so this error means the record was not stored.
    #[error("durable log failure during {context}")]
    Storage {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation exceeded its deadline. For submissions this means the
    /// remote outcome is unknown and must be resolved by a status check.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// A record id that does not exist in this race session.
    #[error("no such record: {id}")]
    UnknownRecord { id: RecordId },

    /// A bib number with no registered racer.
    #[error("no racer registered with bib {bib}")]
    UnknownRacer { bib: Bib },

    /// A submission-state transition that violates the forward-only model.
    #[error("invalid submission state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TimingError {
    /// Returns whether this error is expected to clear on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TimingError::ClockUntrusted { .. } => true,
            TimingError::TransientSubmission { .. } => true,
            TimingError::SyncUnreachable { .. } => true,
            TimingError::Timeout { .. } => true,
            TimingError::Conflict { .. } => false,
            TimingError::PermanentSubmission { .. } => false,
            TimingError::Storage { .. } => false,
            TimingError::UnknownRecord { .. } => false,
            TimingError::UnknownRacer { .. } => false,
            TimingError::InvalidTransition { .. } => false,
            TimingError::Config { .. } => false,
        }
    }

    /// Returns whether this error is warning-grade: the operation degraded
    /// but timing continues.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            TimingError::ClockUntrusted { .. } | TimingError::SyncUnreachable { .. }
        )
    }

    /// Helper constructor for clock trust warnings.
    pub fn clock_untrusted(reason: impl Into<String>) -> Self {
        TimingError::ClockUntrusted { reason: reason.into() }
    }

    /// Helper constructor for transient submission failures.
    pub fn transient_submission(reason: impl Into<String>) -> Self {
        TimingError::TransientSubmission { reason: reason.into(), source: None }
    }

    /// Helper constructor for transient submission failures with a source.
    pub fn transient_submission_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TimingError::TransientSubmission { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for permanent remote rejections.
    pub fn permanent_submission(reason: impl Into<String>) -> Self {
        TimingError::PermanentSubmission { reason: reason.into() }
    }

    /// Helper constructor for unreachable-peer deferrals.
    pub fn sync_unreachable(peer: StationId, reason: impl Into<String>) -> Self {
        TimingError::SyncUnreachable { peer, reason: reason.into() }
    }

    /// Helper constructor for durable log failures.
    pub fn storage(
        context: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TimingError::Storage { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        TimingError::Config { reason: reason.into(), source: None }
    }
}

impl From<std::io::Error> for TimingError {
    fn from(err: std::io::Error) -> Self {
        TimingError::Storage { context: "io".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_json::Error> for TimingError {
    fn from(err: serde_json::Error) -> Self {
        TimingError::Storage { context: "journal encoding".to_string(), source: Some(Box::new(err)) }
    }
}
