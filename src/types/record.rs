//! Result records: the durable association of an event to a racer.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Bib, EventId, TimingEvent};

/// Store-assigned identifier of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Which result a record represents for its racer.
///
/// The uniqueness invariant is scoped per `(racer, category)` pair: a
/// racer has at most one active start and one active finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCategory {
    Start,
    Finish,
}

impl fmt::Display for ResultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCategory::Start => f.write_str("start"),
            ResultCategory::Finish => f.write_str("finish"),
        }
    }
}

/// Race outcome carried by a record instead of, or alongside, a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Normal timed result.
    Timed,
    /// Did not start.
    Dns,
    /// Did not finish.
    Dnf,
    /// Did not place (timed but out of classification).
    Dnp,
}

impl Outcome {
    /// Whether the remote payload should flag this result as a non-finish.
    pub fn is_dnf_class(self) -> bool {
        matches!(self, Outcome::Dns | Outcome::Dnf | Outcome::Dnp)
    }
}

/// Remote delivery state of a record.
///
/// Transitions are strictly forward: `Local -> Queued -> Submitted ->
/// {Acknowledged, Rejected}`. Retry paths re-enter `Queued` (from
/// `Submitted` after a resolved-transient failure, or from `Rejected` on
/// manual resubmission) with an incremented attempt counter; history is
/// never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionState {
    /// Committed locally, not yet handed to the pipeline.
    Local,
    /// Waiting in the submission queue.
    Queued,
    /// In flight; the remote outcome is not yet known.
    Submitted,
    /// The remote accepted and recorded the result.
    Acknowledged,
    /// The remote rejected the result, or retries were exhausted.
    Rejected,
}

impl SubmissionState {
    /// Forward-only transition check.
    pub fn can_transition_to(self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Local, Queued)
                | (Queued, Submitted)
                | (Submitted, Acknowledged)
                | (Submitted, Rejected)
                // Retry re-entry paths, attempt counter bumps.
                | (Submitted, Queued)
                | (Rejected, Queued)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SubmissionState::Local => "local",
            SubmissionState::Queued => "queued",
            SubmissionState::Submitted => "submitted",
            SubmissionState::Acknowledged => "acknowledged",
            SubmissionState::Rejected => "rejected",
        }
    }

    /// Terminal success state.
    pub fn is_acknowledged(self) -> bool {
        matches!(self, SubmissionState::Acknowledged)
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The durable association of a [`TimingEvent`] to a racer, plus delivery
/// state.
///
/// Owned exclusively by the result store once committed. The embedded
/// event never changes; corrections replace the whole record through a
/// supersede chain that keeps every prior event visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: RecordId,
    pub event: TimingEvent,
    /// `None` until an operator or import assigns the capture to a racer.
    pub racer: Option<Bib>,
    pub category: ResultCategory,
    pub outcome: Outcome,
    pub state: SubmissionState,
    /// Submission attempts so far, bumped each time the record goes out
    /// on the wire.
    pub attempts: u32,
    /// Event of the correction that replaced this record. Keyed by event
    /// identity, not record id, so the linkage survives peer exchange;
    /// record ids are store-local. The record stays in history and is
    /// excluded from the active result set.
    pub superseded_by: Option<EventId>,
    /// Event this record corrects, if any.
    pub supersedes: Option<EventId>,
    /// Reconciliation could not order this record against a concurrent
    /// capture from another station; an operator must adjudicate.
    pub needs_review: bool,
}

impl ResultRecord {
    /// Whether this record is on the active (non-superseded) track for its
    /// racer and category.
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Whether the submission pipeline may pick this record up.
    pub fn is_submittable(&self) -> bool {
        self.is_active() && self.racer.is_some() && self.state == SubmissionState::Queued
    }

    /// Time to report to the remote: reference-adjusted capture time.
    pub fn reported_ms(&self) -> i64 {
        self.event.adjusted_ms()
    }
}
