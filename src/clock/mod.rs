//! Clock trust: keeping wall-clock time honest against a reference.
//!
//! A timing station cannot assume its own clock. This module maintains the
//! offset between the local wall clock and a trusted external reference,
//! detects drift, and classifies every instant with a [`TrustLevel`]:
//!
//! - [`TimeReference`] is the probeable external time source
//! - [`ClockTrust`] holds the rolling sample window and the trust verdict
//! - [`ClockProber`] is the periodic probe task; it publishes the latest
//!   [`TrustSnapshot`] over a watch channel so capture can read it without
//!   ever waiting on the network
//!
//! Probe failures never block capture. A station that cannot reach the
//! reference keeps timing with `Unsynced` trust and is corrected later.

mod probe;
mod reference;
mod trust;

pub use probe::ClockProber;
pub use reference::{SystemTimeReference, TimeReference};
pub use trust::{ClockTrust, TrustSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in ms since the Unix epoch.
///
/// A clock set before 1970 reads as 0 rather than panicking; every capture
/// it stamps will be flagged by trust evaluation anyway.
pub(crate) fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
