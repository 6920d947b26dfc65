//! Round-trip clock samples.

use std::time::Duration;

/// One round-trip probe against the trusted time reference.
///
/// The reference timestamp is observed somewhere inside the round trip, so
/// the offset estimate carries an error bounded by half the round-trip
/// delay. Samples with a long round trip are rejected by
/// [`ClockTrust`](crate::clock::ClockTrust) because asymmetric network
/// delay corrupts the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Local wall clock at the midpoint of the probe, ms since the epoch.
    pub local_ms: i64,
    /// Reference clock as reported by the time source, ms since the epoch.
    pub reference_ms: i64,
    /// Full round-trip delay of the probe.
    pub round_trip: Duration,
}

impl ClockSample {
    /// Estimated offset to add to local time to land on reference time.
    pub fn offset_ms(&self) -> i64 {
        self.reference_ms - self.local_ms
    }

    /// Worst-case error of [`offset_ms`](Self::offset_ms) in ms, assuming
    /// the reference read happened anywhere inside the round trip.
    pub fn error_bound_ms(&self) -> i64 {
        (self.round_trip.as_millis() / 2) as i64
    }
}
