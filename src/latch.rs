//! The latch: turning a trigger into an immutable captured-time event.
//!
//! This is the single atomic operation at the heart of the engine. A
//! capture must be safe under rapid operator taps, must stamp the clock
//! trust state at the instant of capture, and must never wait on the
//! network: the local clock is read first, then the current trust
//! snapshot is copied out of the watch channel the probe task maintains.
//!
//! Duplicate rapid taps are preserved as separate events. Dropping a tap
//! silently risks losing the real finish time, so deduplication is an
//! explicit, reviewed operator action downstream, never a capture-time
//! decision.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::trace;

use crate::clock::{TrustSnapshot, wall_clock_ms};
use crate::types::{EventId, StationId, TimingEvent, Trigger, TrustLevel};

/// Per-station time-capture primitive.
///
/// The sequence counter is in-process only; ordering across stations is
/// resolved later by reconciliation, never assumed at capture time.
pub struct Latch {
    station: StationId,
    sequence: AtomicU64,
    trust: watch::Receiver<TrustSnapshot>,
}

impl Latch {
    /// Create a latch for `station`, continuing after `last_sequence`
    /// (zero for a fresh race, the replayed high-water mark after a
    /// restart so sequence numbers never repeat).
    pub fn new(
        station: StationId,
        last_sequence: u64,
        trust: watch::Receiver<TrustSnapshot>,
    ) -> Self {
        Latch { station, sequence: AtomicU64::new(last_sequence), trust }
    }

    pub fn station(&self) -> &StationId {
        &self.station
    }

    /// Capture the current instant.
    ///
    /// Synchronous and non-blocking: reads the local clock, takes the next
    /// sequence number, and copies the latest trust snapshot. Response
    /// time never depends on clock-sync network activity.
    pub fn capture(&self, trigger: Trigger) -> TimingEvent {
        // Clock first: nothing that follows may delay the timestamp.
        let captured_local_ms = wall_clock_ms();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = *self.trust.borrow();

        let event = TimingEvent {
            id: EventId::new(self.station.clone(), sequence),
            captured_local_ms,
            applied_offset_ms: snapshot.offset_ms,
            trust: snapshot.trust,
            trigger,
        };
        trace!(id = %event.id, trust = ?event.trust, "captured timing event");
        event
    }

    /// Record a hand-entered time (paper backup, correction).
    ///
    /// Consumes a sequence number like any capture but is stamped
    /// [`TrustLevel::Manual`] with no offset, so reconciliation never
    /// orders it against other stations by wall clock.
    pub fn manual(&self, entered_ms: i64) -> TimingEvent {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        TimingEvent {
            id: EventId::new(self.station.clone(), sequence),
            captured_local_ms: entered_ms,
            applied_offset_ms: 0,
            trust: TrustLevel::Manual,
            trigger: Trigger::Operator,
        }
    }
}
