//! Timing events and their identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one timing station.
///
/// Stations are named by the operator ("finish-1", "chicane"). The name is
/// part of every event's global identity, so it must be unique within a
/// race and stable for the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(name: impl Into<String>) -> Self {
        StationId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identity of a timing event.
///
/// Sequence numbers are only unique per station; the pair
/// `(station, sequence)` is unique across the whole race and is the merge
/// key used by reconciliation to keep merges idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub station: StationId,
    pub sequence: u64,
}

impl EventId {
    pub fn new(station: StationId, sequence: u64) -> Self {
        EventId { station, sequence }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.station, self.sequence)
    }
}

/// A station's sequence high-water mark.
///
/// Watermarks decide what must travel in the next peer exchange; anything
/// at or below the mark is already on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationView {
    pub station: StationId,
    pub high_watermark: u64,
}

impl StationView {
    pub fn new(station: StationId, high_watermark: u64) -> Self {
        StationView { station, high_watermark }
    }

    /// The known mark for `station` in a set of views, zero when unseen.
    pub fn mark_for(views: &[StationView], station: &StationId) -> u64 {
        views
            .iter()
            .find(|v| &v.station == station)
            .map(|v| v.high_watermark)
            .unwrap_or(0)
    }
}

/// Confidence classification of a captured timestamp relative to the
/// reference clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Captured while the local clock was verified against the reference.
    Synced,
    /// Captured while the reference was unreachable or drifting; the time
    /// is real but may need correction once sync returns.
    Unsynced,
    /// Entered by hand by an operator (corrections, paper backups).
    Manual,
}

impl TrustLevel {
    /// Whether timestamps at this level may be globally ordered against
    /// other stations by wall-clock comparison.
    pub fn orderable(self) -> bool {
        matches!(self, TrustLevel::Synced)
    }
}

/// What caused a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// An operator tap.
    Operator,
    /// An automatic source (photo cell, transponder bridge).
    Automatic,
}

/// One captured timestamp, immutable once created.
///
/// Corrections happen by superseding the owning record with a new event,
/// never by mutating this one; the original stays visible in history.
/// Assignment to a racer lives on the [`ResultRecord`](crate::ResultRecord),
/// not here, so late assignment cannot alter the captured time or sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEvent {
    /// Global identity and merge key.
    pub id: EventId,
    /// Local wall clock at the instant of capture, ms since the Unix epoch.
    pub captured_local_ms: i64,
    /// Reference-clock offset applied at capture time, in ms. Zero when
    /// the trust level is `Unsynced` or `Manual`.
    pub applied_offset_ms: i64,
    /// Clock trust at the instant of capture.
    pub trust: TrustLevel,
    /// What produced this capture.
    pub trigger: Trigger,
}

impl TimingEvent {
    /// Capture time corrected onto the reference clock.
    ///
    /// Only meaningful for cross-station ordering when `trust` is
    /// [`TrustLevel::Synced`]; reconciliation falls back to the stable
    /// `(station, sequence)` order otherwise.
    pub fn adjusted_ms(&self) -> i64 {
        self.captured_local_ms + self.applied_offset_ms
    }
}
