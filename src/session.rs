//! One station's running timing session.
//!
//! [`RaceSession`] wires the pieces together: it opens the journal-backed
//! store, starts the clock probe and submission worker, and exposes the
//! operator-facing operations (capture, assign, correct, submit,
//! reconcile). Dropping the session stops the background tasks.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{ClockProber, TimeReference, TrustSnapshot};
use crate::config::TimingConfig;
use crate::error::{Result, TimingError};
use crate::import::{ImportSummary, import_roster};
use crate::latch::Latch;
use crate::store::{DurableLog, RecordFilter, RecordUpdate, ResultStore};
use crate::submit::{Remote, SubmissionPipeline};
use crate::sync::{MergeReport, PeerLink, StationSync};
use crate::types::{
    Bib, Outcome, Racer, RecordId, ResultCategory, ResultRecord, StationId, TimingEvent, Trigger,
    TrustLevel,
};

pub struct RaceSession {
    station: StationId,
    store: Arc<ResultStore>,
    latch: Latch,
    trust: watch::Receiver<TrustSnapshot>,
    sync: StationSync,
    pipeline: SubmissionPipeline,
    cancel: CancellationToken,
}

impl RaceSession {
    /// Open a session for this station.
    ///
    /// Replays the journal, resumes the station's sequence counter past
    /// anything already recorded, and starts the clock probe and the
    /// submission worker.
    pub async fn open(
        station: StationId,
        config: TimingConfig,
        log: Arc<dyn DurableLog>,
        reference: Arc<dyn TimeReference>,
        remote: Arc<dyn Remote>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let store = Arc::new(ResultStore::open(log).await?);
        let trust = ClockProber::spawn(reference, &config, cancel.child_token());
        let latch = Latch::new(station.clone(), store.last_sequence(&station), trust.clone());
        let sync = StationSync::new(Arc::clone(&store), &config);
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote, &config, cancel.child_token());
        info!(station = %station, "session open");
        Ok(RaceSession { station, store, latch, trust, sync, pipeline, cancel })
    }

    pub fn station(&self) -> &StationId {
        &self.station
    }

    /// Latest clock verdict: current offset and trust level.
    pub fn clock(&self) -> TrustSnapshot {
        *self.trust.borrow()
    }

    /// The clock verdict as a result: the snapshot when the offset is
    /// trusted, [`TimingError::ClockUntrusted`] otherwise.
    ///
    /// Capture never requires this; it is for surfaces that want to warn
    /// the operator before relying on cross-station ordering.
    pub fn verify_clock(&self) -> Result<TrustSnapshot> {
        let snapshot = *self.trust.borrow();
        if snapshot.trust == TrustLevel::Synced {
            Ok(snapshot)
        } else {
            Err(TimingError::clock_untrusted(
                "no fresh reference sample; captures carry unsynced trust",
            ))
        }
    }

    // ------------------------------------------------------------------
    // Capture

    /// Capture the current instant. Synchronous; never waits on the
    /// network or the journal.
    pub fn capture(&self, trigger: Trigger) -> TimingEvent {
        self.latch.capture(trigger)
    }

    /// Capture now and commit as a timed result, optionally assigned.
    pub async fn record_timed(
        &self,
        racer: Option<Bib>,
        category: ResultCategory,
    ) -> Result<ResultRecord> {
        let event = self.latch.capture(Trigger::Operator);
        self.store.commit(event, racer, category, Outcome::Timed).await
    }

    /// Commit a previously captured event.
    pub async fn commit(
        &self,
        event: TimingEvent,
        racer: Option<Bib>,
        category: ResultCategory,
        outcome: Outcome,
    ) -> Result<ResultRecord> {
        self.store.commit(event, racer, category, outcome).await
    }

    /// Commit an operator-entered time. Carries `Manual` trust and never
    /// participates in cross-station ordering claims.
    pub async fn manual_entry(
        &self,
        entered_ms: i64,
        racer: Option<Bib>,
        category: ResultCategory,
        outcome: Outcome,
    ) -> Result<ResultRecord> {
        let event = self.latch.manual(entered_ms);
        self.store.commit(event, racer, category, outcome).await
    }

    // ------------------------------------------------------------------
    // Adjudication

    /// Assign a racer to an unassigned record.
    pub async fn assign(&self, id: RecordId, bib: Bib) -> Result<ResultRecord> {
        self.store.assign(id, bib).await
    }

    /// Supersede a record with a fresh capture, keeping its racer and
    /// category. The old record stays as auditable history.
    pub async fn recapture(&self, id: RecordId) -> Result<ResultRecord> {
        let event = self.latch.capture(Trigger::Operator);
        self.store.supersede(id, event, None).await
    }

    /// Supersede a record with an operator-entered time.
    pub async fn correct_time(&self, id: RecordId, entered_ms: i64) -> Result<ResultRecord> {
        let event = self.latch.manual(entered_ms);
        self.store.supersede(id, event, None).await
    }

    /// Supersede a record changing only its outcome (DNF and friends).
    /// The reported time carries over.
    pub async fn correct_outcome(&self, id: RecordId, outcome: Outcome) -> Result<ResultRecord> {
        let old = self.store.record(id)?;
        let event = self.latch.manual(old.reported_ms());
        self.store.supersede(id, event, Some(outcome)).await
    }

    /// Mark a record as needing operator review.
    pub async fn flag_review(&self, id: RecordId) -> Result<ResultRecord> {
        self.store.flag_review(id).await
    }

    // ------------------------------------------------------------------
    // Delivery

    /// Queue a record for delivery to the remote service.
    pub async fn submit(&self, id: RecordId) -> Result<ResultRecord> {
        self.pipeline.enqueue(id).await
    }

    // ------------------------------------------------------------------
    // Reads

    pub fn record(&self, id: RecordId) -> Result<ResultRecord> {
        self.store.record(id)
    }

    /// Records matching a filter, in reference-adjusted time order.
    pub fn query(&self, filter: &RecordFilter) -> Vec<ResultRecord> {
        self.store.query(filter)
    }

    /// Live feed of record changes for scoreboards and operator UIs.
    pub fn record_updates(&self) -> BroadcastStream<RecordUpdate> {
        BroadcastStream::new(self.store.subscribe())
    }

    // ------------------------------------------------------------------
    // Racers

    pub async fn import_roster(
        &self,
        roster: impl IntoIterator<Item = Racer>,
    ) -> Result<ImportSummary> {
        import_roster(&self.store, roster).await
    }

    pub async fn register_racer(&self, racer: Racer) -> Result<()> {
        self.store.register_racer(racer).await
    }

    pub fn racers(&self) -> Vec<Racer> {
        self.store.racers()
    }

    // ------------------------------------------------------------------
    // Station sync

    /// Exchange records with a peer station and merge what comes back.
    pub async fn reconcile_with(&self, peer: &dyn PeerLink) -> Result<MergeReport> {
        self.sync.run_cycle(peer).await
    }

    /// Stop the background tasks. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RaceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
