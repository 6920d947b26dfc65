//! Offset estimation and trust evaluation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::TimingConfig;
use crate::types::{ClockSample, TrustLevel};

/// The clock state a capture is stamped with.
///
/// Copied out of the watch channel at the instant of capture; reading it
/// never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustSnapshot {
    /// Offset to add to local wall-clock ms to land on reference time.
    pub offset_ms: i64,
    pub trust: TrustLevel,
}

impl TrustSnapshot {
    /// Snapshot before any probe has succeeded.
    pub fn untrusted() -> Self {
        TrustSnapshot { offset_ms: 0, trust: TrustLevel::Unsynced }
    }
}

/// Rolling-window clock trust state.
///
/// Holds the last N accepted samples. Trust requires both a fresh sample
/// and a bounded offset spread across the window; either condition failing
/// degrades the verdict to `Unsynced` without interrupting anything else.
pub struct ClockTrust {
    max_round_trip: Duration,
    window_len: usize,
    freshness: Duration,
    max_spread_ms: i64,
    window: VecDeque<(Instant, ClockSample)>,
}

impl ClockTrust {
    pub fn new(config: &TimingConfig) -> Self {
        ClockTrust {
            max_round_trip: config.max_round_trip(),
            window_len: config.sample_window,
            freshness: config.freshness_window(),
            max_spread_ms: config.max_offset_spread_ms as i64,
            window: VecDeque::with_capacity(config.sample_window),
        }
    }

    /// Offer a probe result to the window.
    ///
    /// Returns `false` when the sample was rejected for an excessive round
    /// trip; asymmetric network delay makes such offsets unusable.
    pub fn accept(&mut self, sample: ClockSample) -> bool {
        if sample.round_trip > self.max_round_trip {
            warn!(
                round_trip_ms = sample.round_trip.as_millis() as u64,
                limit_ms = self.max_round_trip.as_millis() as u64,
                "rejecting clock sample: round trip too long"
            );
            return false;
        }

        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back((Instant::now(), sample));
        debug!(
            offset_ms = sample.offset_ms(),
            window = self.window.len(),
            "accepted clock sample"
        );
        true
    }

    /// Current offset estimate and trust verdict.
    ///
    /// The estimate comes from the window sample with the tightest error
    /// bound (shortest round trip), the standard way to pick among
    /// round-trip probes.
    pub fn current_offset(&self) -> (i64, TrustLevel) {
        let Some(best) = self
            .window
            .iter()
            .min_by_key(|(_, s)| s.round_trip)
            .map(|(_, s)| s.offset_ms())
        else {
            return (0, TrustLevel::Unsynced);
        };

        let trust = if self.has_fresh_sample() && self.spread_ms() <= self.max_spread_ms {
            TrustLevel::Synced
        } else {
            TrustLevel::Unsynced
        };
        (best, trust)
    }

    pub fn is_trusted(&self) -> bool {
        self.current_offset().1 == TrustLevel::Synced
    }

    pub fn snapshot(&self) -> TrustSnapshot {
        let (offset_ms, trust) = self.current_offset();
        TrustSnapshot { offset_ms, trust }
    }

    fn has_fresh_sample(&self) -> bool {
        self.window
            .back()
            .is_some_and(|(at, _)| at.elapsed() <= self.freshness)
    }

    /// Max-min offset across the window. A large spread or sign-flipping
    /// offset means the local clock is being stepped or the network is
    /// lying; either way the estimate is unusable.
    fn spread_ms(&self) -> i64 {
        let offsets = self.window.iter().map(|(_, s)| s.offset_ms());
        match (offsets.clone().min(), offsets.max()) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        }
    }
}
