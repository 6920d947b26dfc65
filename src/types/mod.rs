//! Core types for the timing engine.
//!
//! The data model is small and deliberately rigid:
//!
//! - [`TimingEvent`] is an immutable captured timestamp with a global
//!   identity of `(station, sequence)`
//! - [`ResultRecord`] associates an event with a racer and tracks the
//!   forward-only remote [`SubmissionState`]
//! - [`Racer`] rows are never deleted, only deactivated, so history stays
//!   valid for the whole race
//! - [`ClockSample`] is one round-trip probe against the time reference
//!
//! Everything that crosses the durable log or a station boundary derives
//! serde traits; in-memory-only types (samples) do not.

mod event;
mod racer;
mod record;
mod sample;

pub use event::{EventId, StationId, StationView, TimingEvent, Trigger, TrustLevel};
pub use racer::{Bib, Racer, RegistrationSource};
pub use record::{Outcome, RecordId, ResultCategory, ResultRecord, SubmissionState};
pub use sample::ClockSample;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn event(station: &str, seq: u64, captured: i64, offset: i64, trust: TrustLevel) -> TimingEvent {
        TimingEvent {
            id: EventId::new(StationId::new(station), seq),
            captured_local_ms: captured,
            applied_offset_ms: offset,
            trust,
            trigger: Trigger::Operator,
        }
    }

    proptest! {
        #[test]
        fn adjusted_time_is_capture_plus_offset(
            captured in 0i64..4_000_000_000_000i64,
            offset in -500_000i64..500_000i64
        ) {
            let ev = event("finish-1", 1, captured, offset, TrustLevel::Synced);
            prop_assert_eq!(ev.adjusted_ms(), captured + offset);
        }

        #[test]
        fn event_ids_are_distinct_across_stations_and_sequences(
            seq_a in 1u64..100_000u64,
            seq_b in 1u64..100_000u64
        ) {
            let a = EventId::new(StationId::new("finish-1"), seq_a);
            let b = EventId::new(StationId::new("finish-2"), seq_b);
            prop_assert_ne!(&a, &b);

            let c = EventId::new(StationId::new("finish-1"), seq_b);
            prop_assert_eq!(a == c, seq_a == seq_b);
        }

        #[test]
        fn sample_offset_and_error_bound(
            local in 0i64..4_000_000_000_000i64,
            reference in 0i64..4_000_000_000_000i64,
            rtt_ms in 0u64..10_000u64
        ) {
            let sample = ClockSample {
                local_ms: local,
                reference_ms: reference,
                round_trip: Duration::from_millis(rtt_ms),
            };
            prop_assert_eq!(sample.offset_ms(), reference - local);
            prop_assert_eq!(sample.error_bound_ms(), (rtt_ms / 2) as i64);
        }

        #[test]
        fn submission_state_never_leaves_acknowledged(
            next in prop::sample::select(vec![
                SubmissionState::Local,
                SubmissionState::Queued,
                SubmissionState::Submitted,
                SubmissionState::Acknowledged,
                SubmissionState::Rejected,
            ])
        ) {
            prop_assert!(!SubmissionState::Acknowledged.can_transition_to(next));
        }

        #[test]
        fn submission_state_never_moves_backward_to_local(
            from in prop::sample::select(vec![
                SubmissionState::Local,
                SubmissionState::Queued,
                SubmissionState::Submitted,
                SubmissionState::Acknowledged,
                SubmissionState::Rejected,
            ])
        ) {
            prop_assert!(!from.can_transition_to(SubmissionState::Local));
        }
    }

    #[test]
    fn forward_path_transitions_allowed() {
        use SubmissionState::*;
        assert!(Local.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Acknowledged));
        assert!(Submitted.can_transition_to(Rejected));
    }

    #[test]
    fn retry_reentry_transitions_allowed() {
        use SubmissionState::*;
        assert!(Submitted.can_transition_to(Queued));
        assert!(Rejected.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Queued));
        assert!(!Local.can_transition_to(Submitted));
    }

    #[test]
    fn only_synced_trust_is_orderable() {
        assert!(TrustLevel::Synced.orderable());
        assert!(!TrustLevel::Unsynced.orderable());
        assert!(!TrustLevel::Manual.orderable());
    }

    #[test]
    fn records_roundtrip_through_json() {
        let record = ResultRecord {
            id: RecordId(3),
            event: event("finish-1", 3, 1_000_000, 42, TrustLevel::Synced),
            racer: Some(Bib(42)),
            category: ResultCategory::Finish,
            outcome: Outcome::Timed,
            state: SubmissionState::Queued,
            attempts: 1,
            superseded_by: None,
            supersedes: Some(EventId::new(StationId::new("finish-1"), 1)),
            needs_review: false,
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
