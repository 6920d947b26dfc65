//! Policy configuration with documented defaults.
//!
//! Drift thresholds, retry constants, and queue limits are race-day policy
//! rather than engine behavior, so they all live here and can be loaded
//! from a YAML file. Every field has a default that times a race sensibly
//! with no configuration at all.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TimingError};

/// Policy values for one race session.
///
/// Durations are expressed in milliseconds in the YAML file:
///
/// ```yaml
/// probe_interval_ms: 15000
/// max_round_trip_ms: 250
/// backoff_base_ms: 1000
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Interval between reference-clock probes.
    pub probe_interval_ms: u64,
    /// Probes with a longer round trip are rejected; asymmetric delay
    /// corrupts the offset estimate.
    pub max_round_trip_ms: u64,
    /// Rolling window of accepted samples used for the offset estimate.
    pub sample_window: usize,
    /// A probe older than this no longer counts toward trust.
    pub freshness_window_ms: u64,
    /// Maximum spread of offsets across the window before trust degrades.
    pub max_offset_spread_ms: u64,
    /// Concurrent captures from different stations closer than this are
    /// flagged for manual review when either side was unsynced.
    pub ambiguity_window_ms: u64,
    /// Deadline for one remote submission attempt.
    pub submit_timeout_ms: u64,
    /// First retry delay after a transient submission failure.
    pub backoff_base_ms: u64,
    /// Retry delays double up to this cap.
    pub backoff_cap_ms: u64,
    /// Attempts before a record is marked rejected and surfaced.
    pub max_submit_attempts: u32,
    /// Largest batch handed to the remote in one submission.
    pub bulk_submit_limit: usize,
    /// How long the submission worker waits to fill a batch before
    /// flushing a partial one.
    pub batch_linger_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            probe_interval_ms: 15_000,
            max_round_trip_ms: 250,
            sample_window: 5,
            freshness_window_ms: 60_000,
            max_offset_spread_ms: 100,
            ambiguity_window_ms: 50,
            submit_timeout_ms: 60_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_submit_attempts: 8,
            bulk_submit_limit: 50,
            batch_linger_ms: 250,
        }
    }
}

impl TimingConfig {
    /// Parse a config from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TimingConfig = serde_yaml_ng::from_str(yaml).map_err(|e| {
            TimingError::Config { reason: "invalid YAML".to_string(), source: Some(Box::new(e)) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| TimingError::Config {
            reason: format!("cannot read {}", path.as_ref().display()),
            source: Some(Box::new(e)),
        })?;
        Self::from_yaml(&text)
    }

    /// Check cross-field constraints; called on load and on session open.
    pub fn validate(&self) -> Result<()> {
        if self.sample_window == 0 {
            return Err(TimingError::config("sample_window must be at least 1"));
        }
        if self.max_submit_attempts == 0 {
            return Err(TimingError::config("max_submit_attempts must be at least 1"));
        }
        if self.bulk_submit_limit == 0 {
            return Err(TimingError::config("bulk_submit_limit must be at least 1"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(TimingError::config("backoff_cap_ms must be >= backoff_base_ms"));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn max_round_trip(&self) -> Duration {
        Duration::from_millis(self.max_round_trip_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }
}
