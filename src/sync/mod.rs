//! Station reconciliation: merging per-station event logs.
//!
//! Multiple stations capture events for one race concurrently and only
//! periodically exchange state; partitions between stations are expected,
//! not exceptional. Each station therefore keeps its own log and merges
//! peers' logs by event identity — never by assuming a shared clock:
//!
//! - events are ordered by reference-adjusted capture time only when both
//!   sides were `Synced` at capture
//! - otherwise the merge falls back to the stable `(station, sequence)`
//!   tie-break and flags close pairs for manual review rather than
//!   asserting a false total order
//! - the merge key is the globally unique event id, so re-merging the
//!   same peer state twice is a no-op
//!
//! A station that cannot reach its peer simply defers to the next cycle;
//! operating disconnected is first-class, not a degraded mode.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::Result;
use crate::store::{MergeOutcome, ResultStore};
use crate::types::{ResultRecord, StationId};

pub use crate::types::StationView;

/// Transport to one peer station.
///
/// Implementations carry whatever link the venue has (LAN, cellular
/// bridge, USB stick shuttled between tents). One round trip ships our
/// news past the peer's watermarks and returns theirs past ours.
#[async_trait::async_trait]
pub trait PeerLink: Send + Sync + 'static {
    fn peer_station(&self) -> StationId;

    /// Exchange records: send ours, receive theirs.
    ///
    /// `ours` contains records the peer has not seen according to its last
    /// reported watermarks; the return value is the peer's records above
    /// `our_marks`. Unreachable peers yield
    /// [`TimingError::SyncUnreachable`](crate::TimingError::SyncUnreachable).
    async fn exchange(
        &self,
        ours: Vec<ResultRecord>,
        our_marks: Vec<StationView>,
    ) -> Result<Vec<ResultRecord>>;
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// New events merged into the store.
    pub added: usize,
    /// Events we already had (idempotent re-merge).
    pub duplicates: usize,
    /// Events flagged for manual review.
    pub flagged: usize,
}

/// Reconciles this station's store against peers.
pub struct StationSync {
    store: Arc<ResultStore>,
    ambiguity_window_ms: i64,
    /// Last watermarks each peer reported, for incremental sends.
    peer_views: std::sync::Mutex<HashMap<StationId, Vec<StationView>>>,
}

impl StationSync {
    pub fn new(store: Arc<ResultStore>, config: &TimingConfig) -> Self {
        StationSync {
            store,
            ambiguity_window_ms: config.ambiguity_window_ms as i64,
            peer_views: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run one reconciliation cycle against `peer`.
    ///
    /// Failure to reach the peer is returned as-is; the caller defers and
    /// retries next cycle with nothing lost — the watermarks only advance
    /// on a completed exchange.
    pub async fn run_cycle(&self, peer: &dyn PeerLink) -> Result<MergeReport> {
        let peer_station = peer.peer_station();
        let known = self
            .peer_views
            .lock()
            .expect("sync lock poisoned")
            .get(&peer_station)
            .cloned()
            .unwrap_or_default();

        // Marks first, then the batch: a commit landing between the two is
        // re-sent next cycle (idempotent) instead of stranded below marks
        // it never shipped under.
        let our_marks = self.store.watermarks();
        let ours = self.store.records_since(&known);
        debug!(peer = %peer_station, sending = ours.len(), "starting reconciliation cycle");

        let theirs = match peer.exchange(ours, our_marks.clone()).await {
            Ok(records) => records,
            Err(e) => {
                warn!(peer = %peer_station, error = %e, "peer unreachable, deferring to next cycle");
                return Err(e);
            }
        };

        let report = self.merge(theirs).await?;

        // Advance only to the marks that bounded `ours`. Anything captured
        // while the exchange round trip was in flight sits above them and
        // ships next cycle.
        self.peer_views
            .lock()
            .expect("sync lock poisoned")
            .insert(peer_station.clone(), our_marks);

        info!(
            peer = %peer_station,
            added = report.added,
            duplicates = report.duplicates,
            flagged = report.flagged,
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    /// Merge a batch of peer records into the store.
    ///
    /// Identity-keyed and idempotent. After inserting, concurrent captures
    /// that cannot be honestly ordered (either side unsynced, adjusted
    /// times within the ambiguity window) are flagged for review.
    pub async fn merge(&self, peer_records: Vec<ResultRecord>) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        for peer_record in peer_records {
            match self.store.merge_record(peer_record).await? {
                MergeOutcome::Duplicate => report.duplicates += 1,
                MergeOutcome::FlaggedConflict(_) => {
                    report.added += 1;
                    report.flagged += 1;
                }
                MergeOutcome::Added(record) => {
                    report.added += 1;
                    // Superseded history cannot contend for an order.
                    if record.is_active() {
                        report.flagged += self.flag_ambiguous_neighbors(&record).await?;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Flag `record` and any cross-station neighbor whose relative order
    /// cannot be trusted.
    ///
    /// Two events admit an honest order only when both were captured
    /// `Synced`; a close pair with an unsynced side gets surfaced to the
    /// operator instead.
    async fn flag_ambiguous_neighbors(&self, record: &ResultRecord) -> Result<usize> {
        let mut flagged = 0;
        let center = record.event.adjusted_ms();
        let neighbors = self
            .store
            .records_in_window(center - self.ambiguity_window_ms, center + self.ambiguity_window_ms);

        for other in &neighbors {
            if other.id == record.id || other.event.id.station == record.event.id.station {
                continue;
            }
            if record.event.trust.orderable() && other.event.trust.orderable() {
                continue;
            }

            if !other.needs_review {
                self.store.flag_review(other.id).await?;
                flagged += 1;
            }
            if !self.store.record(record.id)?.needs_review {
                self.store.flag_review(record.id).await?;
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}

/// Pure merge of two already-materialized event sequences.
///
/// Convenience for read models and reports that want a combined view
/// without touching the store: concatenates, deduplicates by event id,
/// and sorts by adjusted time with the stable identity tie-break.
pub fn merge_sequences(local: &[ResultRecord], peer: &[ResultRecord]) -> Vec<ResultRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut merged: Vec<ResultRecord> = local
        .iter()
        .chain(peer.iter())
        .filter(|r| seen.insert(r.event.id.clone()))
        .cloned()
        .collect();
    merged.sort_by(|a, b| {
        a.event
            .adjusted_ms()
            .cmp(&b.event.adjusted_ms())
            .then_with(|| a.event.id.cmp(&b.event.id))
    });
    merged
}
