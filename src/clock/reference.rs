//! The trusted time reference interface.

use crate::error::Result;

/// A round-trip-probeable time source.
///
/// Implementations wrap whatever the venue trusts: an NTP pool, a
/// cell-network time service, a GPS head unit. The engine only needs one
/// operation and tolerates total unavailability — probes that fail are
/// retried on the next scheduled interval.
#[async_trait::async_trait]
pub trait TimeReference: Send + Sync + 'static {
    /// One round trip: the reference's current time in ms since the Unix
    /// epoch, observed at some instant inside the call.
    async fn reference_ms(&self) -> Result<i64>;
}

/// Reference that reports the local system clock back.
///
/// For races run without any external reference: offsets come out as zero
/// and the station reads as synced to itself. Multi-station races should
/// point every station at the same real reference instead.
pub struct SystemTimeReference;

#[async_trait::async_trait]
impl TimeReference for SystemTimeReference {
    async fn reference_ms(&self) -> Result<i64> {
        Ok(super::wall_clock_ms())
    }
}
