//! The remote race-management service interface.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::types::{Bib, EventId, ResultCategory, ResultRecord};

/// Stable identifier ensuring repeated submission of the same result has
/// one remote effect.
///
/// Derived from the event's global identity, so it is identical across
/// retries and across a crash/restart. A correction (supersede) carries a
/// new event and therefore a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_event(id: &EventId) -> Self {
        IdempotencyKey(format!("{}-{}", id.station, id.sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One result as handed to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub key: IdempotencyKey,
    pub bib: Bib,
    pub category: ResultCategory,
    /// Reference-adjusted time, ms since the Unix epoch. Meaningless when
    /// `dnf` is set.
    pub time_ms: i64,
    /// Non-finish outcome (DNS/DNF/DNP).
    pub dnf: bool,
}

impl ResultPayload {
    /// Build the payload for a record, or `None` if it has no racer yet.
    pub fn from_record(record: &ResultRecord) -> Option<Self> {
        record.racer.map(|bib| ResultPayload {
            key: IdempotencyKey::for_event(&record.event.id),
            bib,
            category: record.category,
            time_ms: record.reported_ms(),
            dnf: record.outcome.is_dnf_class(),
        })
    }
}

/// Per-result verdict from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Recorded remotely.
    Accepted,
    /// Explicitly refused (duplicate bib, malformed payload). Permanent;
    /// never retried automatically.
    Rejected { reason: String },
    /// The remote could not say; resolved later by a status check.
    Unknown,
}

/// A remote service accepting race results.
///
/// Implementations are expected to honor idempotency keys. Even when they
/// do not, the pipeline never re-submits a record it has marked
/// `Submitted` until a status check confirms the earlier attempt died.
#[async_trait::async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Submit a batch, returning one outcome per payload, in order.
    ///
    /// Transport-level failures (connection refused, 5xx-equivalent) are
    /// returned as retryable errors, not outcomes.
    async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>>;

    /// Idempotent status check: what became of an earlier submission?
    ///
    /// `None` means the remote has no record of the key — the earlier
    /// attempt never landed and a re-submission is safe.
    async fn check(&self, key: &IdempotencyKey) -> Result<Option<SubmitOutcome>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, RecordId, StationId, SubmissionState, TimingEvent, Trigger, TrustLevel};

    fn record(bib: Option<u32>, outcome: Outcome) -> ResultRecord {
        ResultRecord {
            id: RecordId(1),
            event: TimingEvent {
                id: EventId::new(StationId::new("finish-1"), 17),
                captured_local_ms: 10_000,
                applied_offset_ms: 25,
                trust: TrustLevel::Synced,
                trigger: Trigger::Operator,
            },
            racer: bib.map(Bib),
            category: ResultCategory::Finish,
            outcome,
            state: SubmissionState::Queued,
            attempts: 0,
            superseded_by: None,
            supersedes: None,
            needs_review: false,
        }
    }

    #[test]
    fn keys_are_stable_per_event() {
        let a = IdempotencyKey::for_event(&EventId::new(StationId::new("finish-1"), 17));
        let b = IdempotencyKey::for_event(&EventId::new(StationId::new("finish-1"), 17));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "finish-1-17");

        let other = IdempotencyKey::for_event(&EventId::new(StationId::new("finish-2"), 17));
        assert_ne!(a, other);
    }

    #[test]
    fn payload_reports_adjusted_time() {
        let payload = ResultPayload::from_record(&record(Some(42), Outcome::Timed)).unwrap();
        assert_eq!(payload.time_ms, 10_025);
        assert!(!payload.dnf);
        assert_eq!(payload.bib, Bib(42));
    }

    #[test]
    fn unassigned_records_have_no_payload() {
        assert!(ResultPayload::from_record(&record(None, Outcome::Timed)).is_none());
    }

    #[test]
    fn non_finish_outcomes_set_the_dnf_flag() {
        let payload = ResultPayload::from_record(&record(Some(42), Outcome::Dnf)).unwrap();
        assert!(payload.dnf);
    }
}
