//! The result store: authoritative, append-mostly ledger of timing events.
//!
//! Everything captured ends up here. The store owns committed events
//! exclusively and enforces the engine's two hard rules:
//!
//! 1. A commit is durable (journaled) before it is visible or confirmed.
//! 2. At most one active result exists per `(racer, category)` pair;
//!    committing a second one without a supersede reference fails with a
//!    conflict that an operator must resolve. Corrections supersede,
//!    keeping the prior record visible in history.
//!
//! Read models subscribe to [`RecordUpdate`] notifications; they never
//! reach into the store's structures.
//!
//! ## Concurrency
//!
//! Conflict checks and index updates run under one short in-process lock;
//! journal I/O happens outside it. Commits reserve their uniqueness slot
//! under the lock, append to the journal, and only then become visible,
//! so a failed append leaves no trace and a concurrent conflicting commit
//! loses the reservation race instead of double-committing. Submission
//! state transitions apply in memory first and journal after; a crash in
//! that window is recovered by the pipeline's idempotent status check.

mod journal;

pub use journal::{DurableLog, FileLog, LogEntry, MemoryLog};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, TimingError};
use crate::types::{
    Bib, EventId, Outcome, Racer, RecordId, ResultCategory, ResultRecord, StationId, StationView,
    SubmissionState, TimingEvent,
};

/// What changed, published to read models on every mutation.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub kind: UpdateKind,
    pub record: ResultRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Committed,
    Assigned,
    StateChanged,
    Superseded,
    /// Arrived from a peer station during reconciliation.
    Merged,
    /// Flagged for manual review.
    Flagged,
}

/// Outcome of merging one peer record.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// New event, inserted.
    Added(ResultRecord),
    /// Already present (idempotent re-merge).
    Duplicate,
    /// Inserted, but it contends with a local record for the same racer
    /// and category; both sides are flagged for review.
    FlaggedConflict(ResultRecord),
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub station: Option<StationId>,
    pub racer: Option<Bib>,
    pub category: Option<ResultCategory>,
    pub state: Option<SubmissionState>,
    /// Exclude superseded history records.
    pub active_only: bool,
    /// Only records awaiting operator adjudication.
    pub needs_review_only: bool,
}

impl RecordFilter {
    pub fn active() -> Self {
        RecordFilter { active_only: true, ..Default::default() }
    }

    pub fn for_racer(bib: Bib) -> Self {
        RecordFilter { racer: Some(bib), ..Default::default() }
    }

    fn matches(&self, record: &ResultRecord) -> bool {
        if self.active_only && !record.is_active() {
            return false;
        }
        if self.needs_review_only && !record.needs_review {
            return false;
        }
        if let Some(station) = &self.station {
            if &record.event.id.station != station {
                return false;
            }
        }
        if let Some(bib) = self.racer {
            if record.racer != Some(bib) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct StoreInner {
    next_record: u64,
    records: BTreeMap<RecordId, ResultRecord>,
    by_event: HashMap<EventId, RecordId>,
    /// Adjusted-time index for neighbor range scans. Events are immutable,
    /// so entries never move.
    by_time: BTreeMap<i64, Vec<RecordId>>,
    /// Old event -> superseding event, so a correction that arrives from a
    /// peer before its stale original can still claim it.
    superseding: HashMap<EventId, EventId>,
    racers: HashMap<Bib, Racer>,
    /// Active (non-superseded) record per uniqueness slot.
    active: HashMap<(Bib, ResultCategory), RecordId>,
}

impl StoreInner {
    fn allocate(&mut self) -> RecordId {
        self.next_record += 1;
        RecordId(self.next_record)
    }

    /// Insert a record and keep the secondary indexes consistent.
    fn insert_record(&mut self, record: ResultRecord) {
        if let Some(old_event) = &record.supersedes {
            self.superseding.insert(old_event.clone(), record.event.id.clone());
        }
        self.by_time.entry(record.event.adjusted_ms()).or_default().push(record.id);
        self.records.insert(record.id, record);
    }
}

/// The authoritative record ledger for one race session.
pub struct ResultStore {
    inner: Mutex<StoreInner>,
    log: Arc<dyn DurableLog>,
    updates: broadcast::Sender<RecordUpdate>,
}

impl ResultStore {
    /// Open a store over `log`, replaying any existing entries.
    pub async fn open(log: Arc<dyn DurableLog>) -> Result<Self> {
        let entries = log.replay().await?;
        let mut inner = StoreInner::default();
        for entry in entries {
            Self::apply_replayed(&mut inner, entry);
        }
        info!(records = inner.records.len(), racers = inner.racers.len(), "result store opened");

        let (updates, _) = broadcast::channel(256);
        Ok(ResultStore { inner: Mutex::new(inner), log, updates })
    }

    fn apply_replayed(inner: &mut StoreInner, entry: LogEntry) {
        match entry {
            LogEntry::Racer(racer) => {
                inner.racers.insert(racer.bib, racer);
            }
            LogEntry::Commit(record) => {
                inner.next_record = inner.next_record.max(record.id.0);
                inner.by_event.insert(record.event.id.clone(), record.id);
                if let Some(bib) = record.racer {
                    if record.is_active() {
                        // First holder keeps the slot: a contended merge was
                        // journaled flagged and never took it live.
                        inner.active.entry((bib, record.category)).or_insert(record.id);
                    }
                }
                inner.insert_record(record);
            }
            LogEntry::Assign { id, bib } => {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.racer = Some(bib);
                    inner.active.insert((bib, record.category), id);
                }
            }
            LogEntry::Transition { id, state, attempts } => {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.state = state;
                    record.attempts = attempts;
                }
            }
            LogEntry::Supersede { old, new } => {
                inner.next_record = inner.next_record.max(new.id.0);
                if let Some(old_record) = inner.records.get_mut(&old) {
                    old_record.superseded_by = Some(new.event.id.clone());
                }
                inner.by_event.insert(new.event.id.clone(), new.id);
                // A contended merged correction was journaled flagged and
                // never held the slot live.
                if new.is_active() && !new.needs_review {
                    if let Some(bib) = new.racer {
                        inner.active.insert((bib, new.category), new.id);
                    }
                }
                inner.insert_record(new);
            }
            LogEntry::Review { id } => {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.needs_review = true;
                }
            }
        }
    }

    /// Subscribe to record state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, kind: UpdateKind, record: ResultRecord) {
        // No subscribers is fine; send only fails then.
        let _ = self.updates.send(RecordUpdate { kind, record });
    }

    // ------------------------------------------------------------------
    // Racers

    /// Register or update a racer. Existing bibs are updated in place
    /// (imports re-run; remote rosters change mid-race).
    pub async fn register_racer(&self, racer: Racer) -> Result<()> {
        self.log.append(&LogEntry::Racer(racer.clone())).await?;
        self.inner.lock().expect("store lock poisoned").racers.insert(racer.bib, racer);
        Ok(())
    }

    /// Deactivate a racer. The row stays; historical events referencing it
    /// remain valid.
    pub async fn deactivate_racer(&self, bib: Bib) -> Result<()> {
        let racer = {
            let inner = self.inner.lock().expect("store lock poisoned");
            let mut racer =
                inner.racers.get(&bib).cloned().ok_or(TimingError::UnknownRacer { bib })?;
            racer.active = false;
            racer
        };
        self.register_racer(racer).await
    }

    pub fn racer(&self, bib: Bib) -> Option<Racer> {
        self.inner.lock().expect("store lock poisoned").racers.get(&bib).cloned()
    }

    pub fn racers(&self) -> Vec<Racer> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut racers: Vec<_> = inner.racers.values().cloned().collect();
        racers.sort_by_key(|r| r.bib);
        racers
    }

    // ------------------------------------------------------------------
    // Records

    /// Commit a captured event, durably, optionally assigned to a racer.
    ///
    /// Unassigned commits are valid; assignment happens later via
    /// [`assign`](Self::assign). Committing an event id that is already
    /// present returns the existing record unchanged.
    ///
    /// # Errors
    ///
    /// [`TimingError::Conflict`] when the racer already has an active
    /// record in this category, [`TimingError::UnknownRacer`] for an
    /// unregistered bib, [`TimingError::Storage`] when the journal append
    /// fails (the commit then has no effect).
    pub async fn commit(
        &self,
        event: TimingEvent,
        racer: Option<Bib>,
        category: ResultCategory,
        outcome: Outcome,
    ) -> Result<ResultRecord> {
        let record = {
            let mut inner = self.inner.lock().expect("store lock poisoned");

            if let Some(existing) = inner.by_event.get(&event.id) {
                let existing = *existing;
                if let Some(record) = inner.records.get(&existing) {
                    return Ok(record.clone());
                }
            }

            if let Some(bib) = racer {
                if !inner.racers.contains_key(&bib) {
                    return Err(TimingError::UnknownRacer { bib });
                }
                if let Some(existing) = inner.active.get(&(bib, category)) {
                    return Err(TimingError::Conflict { bib, category, existing: *existing });
                }
            }

            let id = inner.allocate();
            let record = ResultRecord {
                id,
                event,
                racer,
                category,
                outcome,
                state: SubmissionState::Local,
                attempts: 0,
                superseded_by: None,
                supersedes: None,
                needs_review: false,
            };

            // Reserve identity and uniqueness slots before journaling so a
            // concurrent conflicting commit cannot slip past the check.
            inner.by_event.insert(record.event.id.clone(), id);
            if let Some(bib) = racer {
                inner.active.insert((bib, category), id);
            }
            record
        };

        if let Err(e) = self.log.append(&LogEntry::Commit(record.clone())).await {
            // Roll the reservation back; the commit never happened.
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.by_event.remove(&record.event.id);
            if let Some(bib) = record.racer {
                inner.active.remove(&(bib, record.category));
            }
            return Err(e);
        }

        self.inner
            .lock()
            .expect("store lock poisoned")
            .insert_record(record.clone());
        debug!(id = %record.id, event = %record.event.id, "committed record");
        self.publish(UpdateKind::Committed, record.clone());
        Ok(record)
    }

    /// Assign a racer to an already-committed unassigned record.
    ///
    /// Never alters the captured time or sequence. Assigning an
    /// already-assigned record is a conflict; corrections go through
    /// [`supersede`](Self::supersede).
    pub async fn assign(&self, id: RecordId, bib: Bib) -> Result<ResultRecord> {
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let record = inner.records.get(&id).ok_or(TimingError::UnknownRecord { id })?;

            if let Some(current) = record.racer {
                return Err(TimingError::Conflict {
                    bib: current,
                    category: record.category,
                    existing: id,
                });
            }
            if !inner.racers.contains_key(&bib) {
                return Err(TimingError::UnknownRacer { bib });
            }
            let category = record.category;
            if let Some(existing) = inner.active.get(&(bib, category)) {
                return Err(TimingError::Conflict { bib, category, existing: *existing });
            }
            // Reserve the slot; journal outside the lock.
            inner.active.insert((bib, category), id);
        }

        if let Err(e) = self.log.append(&LogEntry::Assign { id, bib }).await {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let category = inner.records.get(&id).map(|r| r.category);
            if let Some(category) = category {
                inner.active.remove(&(bib, category));
            }
            return Err(e);
        }

        let record = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let record = inner.records.get_mut(&id).ok_or(TimingError::UnknownRecord { id })?;
            record.racer = Some(bib);
            record.clone()
        };
        debug!(id = %id, bib = %bib, "assigned racer to record");
        self.publish(UpdateKind::Assigned, record.clone());
        Ok(record)
    }

    /// Supersede a record with a corrected event.
    ///
    /// The explicit correction path: the old record keeps its event
    /// visible in history and drops off the active track; the new record
    /// inherits the racer and category (and outcome, unless overridden)
    /// and starts back at `Local`.
    pub async fn supersede(
        &self,
        old_id: RecordId,
        new_event: TimingEvent,
        outcome: Option<Outcome>,
    ) -> Result<ResultRecord> {
        let (old_record, new_record) = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let old_record =
                inner.records.get(&old_id).cloned().ok_or(TimingError::UnknownRecord { id: old_id })?;
            if !old_record.is_active() {
                // A superseded record cannot be superseded again; correct
                // the head of the chain instead.
                let head = old_record
                    .superseded_by
                    .as_ref()
                    .and_then(|ev| inner.by_event.get(ev).copied())
                    .unwrap_or(old_id);
                return Err(TimingError::Conflict {
                    bib: old_record.racer.unwrap_or(Bib(0)),
                    category: old_record.category,
                    existing: head,
                });
            }

            let id = inner.allocate();
            let new_record = ResultRecord {
                id,
                event: new_event,
                racer: old_record.racer,
                category: old_record.category,
                outcome: outcome.unwrap_or(old_record.outcome),
                state: SubmissionState::Local,
                attempts: 0,
                superseded_by: None,
                supersedes: Some(old_record.event.id.clone()),
                needs_review: false,
            };
            inner.by_event.insert(new_record.event.id.clone(), id);
            (old_record, new_record)
        };

        if let Err(e) = self
            .log
            .append(&LogEntry::Supersede { old: old_id, new: new_record.clone() })
            .await
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.by_event.remove(&new_record.event.id);
            return Err(e);
        }

        let (old_record, new_record) = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let new_event = new_record.event.id.clone();
            let old_record = match inner.records.get_mut(&old_id) {
                Some(old) => {
                    old.superseded_by = Some(new_event);
                    old.clone()
                }
                None => old_record,
            };
            if let Some(bib) = new_record.racer {
                inner.active.insert((bib, new_record.category), new_record.id);
            }
            inner.insert_record(new_record.clone());
            (old_record, new_record)
        };

        info!(old = %old_id, new = %new_record.id, "superseded record");
        self.publish(UpdateKind::Superseded, old_record);
        self.publish(UpdateKind::Committed, new_record.clone());
        Ok(new_record)
    }

    /// Advance a record's submission state.
    ///
    /// Transitions are forward-only; the attempt counter bumps on every
    /// entry into `Submitted`. Applied in memory first, then journaled —
    /// a crash between the two is resolved by the pipeline's idempotent
    /// status check on restart.
    pub async fn transition(&self, id: RecordId, next: SubmissionState) -> Result<ResultRecord> {
        let record = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let record = inner.records.get_mut(&id).ok_or(TimingError::UnknownRecord { id })?;

            if !record.state.can_transition_to(next) {
                return Err(TimingError::InvalidTransition {
                    from: record.state.name(),
                    to: next.name(),
                });
            }
            record.state = next;
            if next == SubmissionState::Submitted {
                record.attempts += 1;
            }
            record.clone()
        };

        self.log
            .append(&LogEntry::Transition { id, state: record.state, attempts: record.attempts })
            .await?;
        debug!(id = %id, state = %record.state, attempts = record.attempts, "record transition");
        self.publish(UpdateKind::StateChanged, record.clone());
        Ok(record)
    }

    /// Flag a record for manual adjudication.
    pub async fn flag_review(&self, id: RecordId) -> Result<ResultRecord> {
        let record = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let record = inner.records.get_mut(&id).ok_or(TimingError::UnknownRecord { id })?;
            record.needs_review = true;
            record.clone()
        };
        self.log.append(&LogEntry::Review { id }).await?;
        warn!(id = %id, "record flagged for manual review");
        self.publish(UpdateKind::Flagged, record.clone());
        Ok(record)
    }

    /// Merge one record from a peer station.
    ///
    /// Identity-keyed on the event id, so re-merging the same peer state
    /// is a no-op. Supersede linkage travels by event id: a correction
    /// replaces the local copy of the record it corrects, and a record
    /// that was already superseded (on the sender, or by a correction
    /// merged before it) lands straight in history. A live merged record
    /// that contends for an occupied `(racer, category)` slot it does not
    /// correct is inserted off the active track and both sides are
    /// flagged for review rather than silently ordered.
    pub async fn merge_record(&self, peer: ResultRecord) -> Result<MergeOutcome> {
        enum Slot {
            Untouched,
            Taken,
            TakenFrom(RecordId),
        }

        let (record, replaces, contended_with, slot) = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            if inner.by_event.contains_key(&peer.event.id) {
                return Ok(MergeOutcome::Duplicate);
            }

            // Superseded on the sender, or claimed retroactively by a
            // correction that merged before its stale original.
            let superseded_by = peer
                .superseded_by
                .clone()
                .or_else(|| inner.superseding.get(&peer.event.id).cloned());

            // Walk the correction chain down to the live local record this
            // one replaces, if we hold it. Intermediate corrections may
            // already be history on both sides.
            let replaces = if superseded_by.is_none() {
                let mut next = peer.supersedes.clone();
                let mut found = None;
                while let Some(old_event) = next {
                    next = match inner.by_event.get(&old_event).copied() {
                        Some(old_id) => match inner.records.get(&old_id) {
                            Some(old) if old.is_active() => {
                                found = Some(old_id);
                                None
                            }
                            Some(old) => old.supersedes.clone(),
                            None => None,
                        },
                        None => None,
                    };
                }
                found
            } else {
                None
            };

            let id = inner.allocate();
            let mut contended_with = None;
            let mut slot = Slot::Untouched;
            if superseded_by.is_none() {
                if let Some(bib) = peer.racer {
                    let key = (bib, peer.category);
                    match inner.active.get(&key).copied() {
                        Some(holder) if replaces == Some(holder) => {
                            inner.active.insert(key, id);
                            slot = Slot::TakenFrom(holder);
                        }
                        Some(holder) => contended_with = Some(holder),
                        None => {
                            inner.active.insert(key, id);
                            slot = Slot::Taken;
                        }
                    }
                }
            }

            let record = ResultRecord {
                id,
                // Remote submission stays with the originating station.
                state: SubmissionState::Local,
                attempts: 0,
                superseded_by,
                needs_review: contended_with.is_some(),
                ..peer
            };
            inner.by_event.insert(record.event.id.clone(), id);
            (record, replaces, contended_with, slot)
        };

        let entry = match replaces {
            Some(old_id) => LogEntry::Supersede { old: old_id, new: record.clone() },
            None => LogEntry::Commit(record.clone()),
        };
        if let Err(e) = self.log.append(&entry).await {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.by_event.remove(&record.event.id);
            if let Some(bib) = record.racer {
                let key = (bib, record.category);
                match slot {
                    Slot::Taken => {
                        inner.active.remove(&key);
                    }
                    Slot::TakenFrom(holder) => {
                        inner.active.insert(key, holder);
                    }
                    Slot::Untouched => {}
                }
            }
            return Err(e);
        }

        let stale = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let stale = replaces.and_then(|old_id| {
                inner.records.get_mut(&old_id).map(|old| {
                    old.superseded_by = Some(record.event.id.clone());
                    old.clone()
                })
            });
            inner.insert_record(record.clone());
            stale
        };
        if let Some(stale) = stale {
            info!(old = %stale.id, new = %record.id, "merged correction superseded local record");
            self.publish(UpdateKind::Superseded, stale);
        }
        self.publish(UpdateKind::Merged, record.clone());

        match contended_with {
            None => Ok(MergeOutcome::Added(record)),
            Some(local_id) => {
                // The merged record was journaled with its flag already
                // set; only the local side still needs flagging.
                self.flag_review(local_id).await?;
                Ok(MergeOutcome::FlaggedConflict(record))
            }
        }
    }

    /// Snapshot query over the record set.
    ///
    /// Ordered by reference-adjusted capture time with a stable
    /// `(station, sequence)` tie-break — sequence order within a station,
    /// merge-resolved order across stations. The result is a snapshot;
    /// re-issue the query to restart over fresher state.
    pub fn query(&self, filter: &RecordFilter) -> Vec<ResultRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut records: Vec<_> =
            inner.records.values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by(|a, b| {
            a.event
                .adjusted_ms()
                .cmp(&b.event.adjusted_ms())
                .then_with(|| a.event.id.cmp(&b.event.id))
        });
        records
    }

    pub fn record(&self, id: RecordId) -> Result<ResultRecord> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .records
            .get(&id)
            .cloned()
            .ok_or(TimingError::UnknownRecord { id })
    }

    /// Active records with adjusted capture time in `[from_ms, to_ms]`.
    ///
    /// Served from the time index, so neighbor scans stay proportional to
    /// the window instead of the whole record set.
    pub fn records_in_window(&self, from_ms: i64, to_ms: i64) -> Vec<ResultRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut records: Vec<_> = inner
            .by_time
            .range(from_ms..=to_ms)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.event
                .adjusted_ms()
                .cmp(&b.event.adjusted_ms())
                .then_with(|| a.event.id.cmp(&b.event.id))
        });
        records
    }

    /// Per-station sequence high-water marks over everything stored.
    pub fn watermarks(&self) -> Vec<StationView> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut marks: HashMap<StationId, u64> = HashMap::new();
        for record in inner.records.values() {
            let entry = marks.entry(record.event.id.station.clone()).or_insert(0);
            *entry = (*entry).max(record.event.id.sequence);
        }
        let mut views: Vec<StationView> =
            marks.into_iter().map(|(station, mark)| StationView::new(station, mark)).collect();
        views.sort_by(|a, b| a.station.cmp(&b.station));
        views
    }

    /// Records above a peer's watermarks, for incremental exchange.
    pub fn records_since(&self, peer_views: &[StationView]) -> Vec<ResultRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| {
                r.event.id.sequence > StationView::mark_for(peer_views, &r.event.id.station)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.event.id.cmp(&b.event.id));
        records
    }

    /// Highest stored sequence for `station`; the latch resumes above it
    /// after a restart.
    pub fn last_sequence(&self, station: &StationId) -> u64 {
        StationView::mark_for(&self.watermarks(), station)
    }
}
