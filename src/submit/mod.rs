//! Background delivery of committed results to the remote service.
//!
//! A single worker drains a FIFO queue in bounded batches. Each attempt
//! ends in exactly one of three ways: acknowledged, explicitly rejected,
//! or unknown. Unknown outcomes are never blindly re-sent; the worker
//! asks the remote what became of the idempotency key first, and only
//! requeues when the earlier attempt demonstrably never landed. Capture
//! and local commits proceed regardless of what this worker is doing.

mod backoff;
mod remote;

pub use backoff::RetryPolicy;
pub use remote::{IdempotencyKey, Remote, ResultPayload, SubmitOutcome};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{Result, TimingError};
use crate::store::{RecordFilter, ResultStore};
use crate::stream::BatchExt;
use crate::types::{RecordId, ResultRecord, SubmissionState};

/// Handle for queueing records and the worker that delivers them.
pub struct SubmissionPipeline {
    store: Arc<ResultStore>,
    tx: mpsc::UnboundedSender<RecordId>,
}

impl SubmissionPipeline {
    /// Start the delivery worker. It runs until `cancel` fires or the
    /// pipeline handle is dropped.
    pub fn spawn(
        store: Arc<ResultStore>,
        remote: Arc<dyn Remote>,
        config: &TimingConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            store: Arc::clone(&store),
            remote,
            policy: RetryPolicy::from_config(config),
            submit_timeout: config.submit_timeout(),
            batch_limit: config.bulk_submit_limit,
            linger: config.batch_linger(),
        };
        tokio::spawn(worker.run(rx, cancel));
        SubmissionPipeline { store, tx }
    }

    /// Queue a committed record for delivery, returning it in `Queued`
    /// state.
    ///
    /// The record must have a racer assigned. Rejected records may be
    /// queued again after operator correction; acknowledged records may
    /// not.
    pub async fn enqueue(&self, id: RecordId) -> Result<ResultRecord> {
        let record = self.store.record(id)?;
        if record.racer.is_none() {
            return Err(TimingError::permanent_submission(format!(
                "record {id} has no racer assigned"
            )));
        }
        let record = match record.state {
            SubmissionState::Queued => record,
            _ => self.store.transition(id, SubmissionState::Queued).await?,
        };
        self.tx
            .send(id)
            .map_err(|_| TimingError::transient_submission("submission worker stopped"))?;
        Ok(record)
    }
}

struct Worker {
    store: Arc<ResultStore>,
    remote: Arc<dyn Remote>,
    policy: RetryPolicy,
    submit_timeout: Duration,
    batch_limit: usize,
    linger: Duration,
}

impl Worker {
    async fn run(self, rx: mpsc::UnboundedReceiver<RecordId>, cancel: CancellationToken) {
        let stream = UnboundedReceiverStream::new(rx).batched(self.batch_limit, self.linger);
        tokio::pin!(stream);

        // Work left over from a previous run: queued records go straight
        // back on the wire, and records stuck in `Submitted` are resolved
        // by a status check before any new work starts.
        let mut retries = self.recover().await;

        loop {
            if !retries.is_empty() {
                let delay = self.retry_delay(&retries);
                if !delay.is_zero() {
                    debug!(
                        delay_ms = delay.as_millis() as u64,
                        pending = retries.len(),
                        "backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let batch = std::mem::take(&mut retries);
                retries = self.process(batch).await;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = stream.next() => match batch {
                    Some(batch) => retries = self.process(batch).await,
                    None => break,
                },
            }
        }
        debug!("submission worker stopped");
    }

    async fn recover(&self) -> Vec<RecordId> {
        let mut pending = Vec::new();

        let queued = self.store.query(&RecordFilter {
            state: Some(SubmissionState::Queued),
            active_only: true,
            ..Default::default()
        });
        pending.extend(queued.iter().filter(|r| r.racer.is_some()).map(|r| r.id));

        let submitted = self.store.query(&RecordFilter {
            state: Some(SubmissionState::Submitted),
            active_only: true,
            ..Default::default()
        });
        for record in &submitted {
            if self.resolve_unknown(record).await {
                pending.push(record.id);
            }
        }

        if !pending.is_empty() {
            info!(pending = pending.len(), "recovered undelivered results");
        }
        pending
    }

    /// Deliver a set of records, returning the ids that should be retried
    /// after a backoff.
    async fn process(&self, ids: Vec<RecordId>) -> Vec<RecordId> {
        let mut retries = Vec::new();
        for chunk in ids.chunks(self.batch_limit) {
            retries.extend(self.process_chunk(chunk).await);
        }
        retries
    }

    async fn process_chunk(&self, ids: &[RecordId]) -> Vec<RecordId> {
        let mut ready = Vec::new();
        for &id in ids {
            match self.store.record(id) {
                Ok(record) if record.is_submittable() => ready.push(record),
                Ok(record) => {
                    // Superseded or already delivered while waiting.
                    debug!(record = %id, state = record.state.name(), "skipping record");
                }
                Err(err) => warn!(record = %id, %err, "queued record is gone"),
            }
        }
        if ready.is_empty() {
            return Vec::new();
        }

        // Attempts count entries into `Submitted`, so the updated records
        // carry the count for the attempt we are about to make.
        let mut marked = Vec::new();
        for record in ready {
            match self.store.transition(record.id, SubmissionState::Submitted).await {
                Ok(updated) => marked.push(updated),
                Err(err) => warn!(record = %record.id, %err, "could not mark record submitted"),
            }
        }
        if marked.is_empty() {
            return Vec::new();
        }

        let payloads: Vec<ResultPayload> =
            marked.iter().filter_map(ResultPayload::from_record).collect();
        debug!(batch = payloads.len(), "submitting results");

        let attempt =
            tokio::time::timeout(self.submit_timeout, self.remote.submit(&payloads)).await;

        let mut retries = Vec::new();
        match attempt {
            Ok(Ok(mut outcomes)) => {
                if outcomes.len() != marked.len() {
                    warn!(
                        expected = marked.len(),
                        got = outcomes.len(),
                        "remote returned a short outcome list"
                    );
                }
                // Records past the end of a short list stay unknown.
                outcomes.resize(marked.len(), SubmitOutcome::Unknown);
                for (record, outcome) in marked.iter().zip(outcomes) {
                    match outcome {
                        SubmitOutcome::Accepted => self.acknowledge(record).await,
                        SubmitOutcome::Rejected { reason } => self.reject(record, &reason).await,
                        SubmitOutcome::Unknown => {
                            if self.resolve_unknown(record).await {
                                retries.push(record.id);
                            }
                        }
                    }
                }
            }
            Ok(Err(err)) if err.is_retryable() => {
                warn!(%err, batch = marked.len(), "submission failed; verifying outcome");
                for record in &marked {
                    if self.resolve_unknown(record).await {
                        retries.push(record.id);
                    }
                }
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(%err, batch = marked.len(), "remote refused the batch");
                for record in &marked {
                    self.reject(record, &reason).await;
                }
            }
            Err(_) => {
                let err = TimingError::Timeout { duration: self.submit_timeout };
                warn!(%err, batch = marked.len(), "submission timed out; verifying outcome");
                for record in &marked {
                    if self.resolve_unknown(record).await {
                        retries.push(record.id);
                    }
                }
            }
        }
        retries
    }

    /// Ask the remote what became of an attempt whose outcome we never
    /// saw. Returns true when the record should be retried.
    async fn resolve_unknown(&self, record: &ResultRecord) -> bool {
        let key = IdempotencyKey::for_event(&record.event.id);
        match self.remote.check(&key).await {
            Ok(Some(SubmitOutcome::Accepted)) => {
                info!(record = %record.id, "earlier attempt had landed");
                self.acknowledge(record).await;
                false
            }
            Ok(Some(SubmitOutcome::Rejected { reason })) => {
                self.reject(record, &reason).await;
                false
            }
            Ok(Some(SubmitOutcome::Unknown)) | Ok(None) => self.requeue(record).await,
            Err(err) => {
                debug!(record = %record.id, %err, "status check failed");
                self.requeue(record).await
            }
        }
    }

    async fn requeue(&self, record: &ResultRecord) -> bool {
        if self.policy.exhausted(record.attempts) {
            warn!(record = %record.id, attempts = record.attempts, "attempt budget exhausted");
            self.reject(record, "attempt budget exhausted").await;
            return false;
        }
        match self.store.transition(record.id, SubmissionState::Queued).await {
            Ok(_) => true,
            Err(err) => {
                warn!(record = %record.id, %err, "could not requeue record");
                false
            }
        }
    }

    async fn acknowledge(&self, record: &ResultRecord) {
        match self.store.transition(record.id, SubmissionState::Acknowledged).await {
            Ok(updated) => {
                info!(record = %record.id, bib = ?updated.racer, "result acknowledged");
            }
            Err(err) => warn!(record = %record.id, %err, "could not acknowledge record"),
        }
    }

    async fn reject(&self, record: &ResultRecord, reason: &str) {
        warn!(record = %record.id, reason, "result rejected; operator review required");
        if let Err(err) = self.store.transition(record.id, SubmissionState::Rejected).await {
            warn!(record = %record.id, %err, "could not mark record rejected");
        }
    }

    fn retry_delay(&self, ids: &[RecordId]) -> Duration {
        let attempts = ids
            .iter()
            .filter_map(|&id| self.store.record(id).ok())
            .map(|r| r.attempts)
            .max()
            .unwrap_or(1);
        self.policy.delay(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DurableLog, MemoryLog};
    use crate::types::{
        Bib, EventId, Outcome, Racer, ResultCategory, StationId, TimingEvent, Trigger, TrustLevel,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(seq: u64) -> TimingEvent {
        TimingEvent {
            id: EventId::new(StationId::new("finish-1"), seq),
            captured_local_ms: 1_000_000 + seq as i64 * 1_000,
            applied_offset_ms: 0,
            trust: TrustLevel::Synced,
            trigger: Trigger::Operator,
        }
    }

    async fn store_with_racer(bib: u32) -> Arc<ResultStore> {
        let store = Arc::new(ResultStore::open(Arc::new(MemoryLog::new())).await.unwrap());
        store.register_racer(Racer::new(Bib(bib), "Test Racer", "open")).await.unwrap();
        store
    }

    fn fast_config() -> TimingConfig {
        TimingConfig {
            backoff_base_ms: 5,
            backoff_cap_ms: 20,
            batch_linger_ms: 5,
            submit_timeout_ms: 500,
            max_submit_attempts: 3,
            ..TimingConfig::default()
        }
    }

    async fn wait_for_state(
        store: &ResultStore,
        id: RecordId,
        state: SubmissionState,
    ) -> ResultRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = store.record(id).unwrap();
                if record.state == state {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("record never reached expected state")
    }

    /// Accepts everything after a configurable number of transport
    /// failures; records every payload it has seen.
    struct FlakyRemote {
        failures_left: AtomicU32,
        accepted: Mutex<Vec<ResultPayload>>,
    }

    impl FlakyRemote {
        fn new(failures: u32) -> Self {
            FlakyRemote { failures_left: AtomicU32::new(failures), accepted: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl Remote for FlakyRemote {
        async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TimingError::transient_submission("connection refused"));
            }
            self.accepted.lock().unwrap().extend_from_slice(batch);
            Ok(batch.iter().map(|_| SubmitOutcome::Accepted).collect())
        }

        async fn check(&self, key: &IdempotencyKey) -> Result<Option<SubmitOutcome>> {
            let seen = self.accepted.lock().unwrap().iter().any(|p| &p.key == key);
            Ok(if seen { Some(SubmitOutcome::Accepted) } else { None })
        }
    }

    /// The submit call dies on the wire but the remote records the result
    /// anyway; only the status check reveals it.
    struct SilentlyAcceptingRemote {
        accepted: Mutex<Vec<ResultPayload>>,
        submits: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Remote for SilentlyAcceptingRemote {
        async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            self.accepted.lock().unwrap().extend_from_slice(batch);
            Err(TimingError::transient_submission("response lost"))
        }

        async fn check(&self, key: &IdempotencyKey) -> Result<Option<SubmitOutcome>> {
            let seen = self.accepted.lock().unwrap().iter().any(|p| &p.key == key);
            Ok(if seen { Some(SubmitOutcome::Accepted) } else { None })
        }
    }

    /// Rejects specific bibs, accepts the rest.
    struct PickyRemote {
        rejected_bib: Bib,
    }

    #[async_trait::async_trait]
    impl Remote for PickyRemote {
        async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>> {
            Ok(batch
                .iter()
                .map(|p| {
                    if p.bib == self.rejected_bib {
                        SubmitOutcome::Rejected { reason: "duplicate result".into() }
                    } else {
                        SubmitOutcome::Accepted
                    }
                })
                .collect())
        }

        async fn check(&self, _key: &IdempotencyKey) -> Result<Option<SubmitOutcome>> {
            Ok(None)
        }
    }

    async fn commit_timed(store: &ResultStore, seq: u64, bib: u32) -> ResultRecord {
        store
            .commit(event(seq), Some(Bib(bib)), ResultCategory::Finish, Outcome::Timed)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_results_become_acknowledged() {
        let store = store_with_racer(42).await;
        let remote = Arc::new(FlakyRemote::new(0));
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote.clone(), &fast_config(), cancel.clone());

        let record = commit_timed(&store, 1, 42).await;
        pipeline.enqueue(record.id).await.unwrap();

        let done = wait_for_state(&store, record.id, SubmissionState::Acknowledged).await;
        assert_eq!(done.attempts, 1);
        assert_eq!(remote.accepted.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn transient_failures_retry_until_delivered() {
        let store = store_with_racer(42).await;
        let remote = Arc::new(FlakyRemote::new(2));
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote.clone(), &fast_config(), cancel.clone());

        let record = commit_timed(&store, 1, 42).await;
        pipeline.enqueue(record.id).await.unwrap();

        let done = wait_for_state(&store, record.id, SubmissionState::Acknowledged).await;
        assert_eq!(done.attempts, 3);
        assert_eq!(remote.accepted.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_outcome_is_resolved_without_resubmitting() {
        let store = store_with_racer(42).await;
        let remote = Arc::new(SilentlyAcceptingRemote {
            accepted: Mutex::new(Vec::new()),
            submits: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote.clone(), &fast_config(), cancel.clone());

        let record = commit_timed(&store, 1, 42).await;
        pipeline.enqueue(record.id).await.unwrap();

        wait_for_state(&store, record.id, SubmissionState::Acknowledged).await;
        // One wire attempt, one remote copy: the status check did the rest.
        assert_eq!(remote.submits.load(Ordering::SeqCst), 1);
        assert_eq!(remote.accepted.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn explicit_rejection_is_not_retried() {
        let store = store_with_racer(42).await;
        store.register_racer(Racer::new(Bib(7), "Other Racer", "open")).await.unwrap();
        let remote = Arc::new(PickyRemote { rejected_bib: Bib(42) });
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote, &fast_config(), cancel.clone());

        let bad = commit_timed(&store, 1, 42).await;
        let good = commit_timed(&store, 2, 7).await;
        pipeline.enqueue(bad.id).await.unwrap();
        pipeline.enqueue(good.id).await.unwrap();

        let rejected = wait_for_state(&store, bad.id, SubmissionState::Rejected).await;
        assert_eq!(rejected.attempts, 1);
        wait_for_state(&store, good.id, SubmissionState::Acknowledged).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn attempt_budget_ends_in_rejection() {
        let store = store_with_racer(42).await;
        let remote = Arc::new(FlakyRemote::new(u32::MAX));
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote, &fast_config(), cancel.clone());

        let record = commit_timed(&store, 1, 42).await;
        pipeline.enqueue(record.id).await.unwrap();

        let rejected = wait_for_state(&store, record.id, SubmissionState::Rejected).await;
        assert_eq!(rejected.attempts, 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unassigned_records_cannot_be_enqueued() {
        let store = store_with_racer(42).await;
        let remote = Arc::new(FlakyRemote::new(0));
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote, &fast_config(), cancel.clone());

        let record = store
            .commit(event(1), None, ResultCategory::Finish, Outcome::Timed)
            .await
            .unwrap();
        let err = pipeline.enqueue(record.id).await.unwrap_err();
        assert!(matches!(err, TimingError::PermanentSubmission { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn pending_work_is_recovered_on_restart() {
        let log = Arc::new(MemoryLog::new());
        let cancel = CancellationToken::new();

        let id = {
            let store =
                Arc::new(ResultStore::open(log.clone() as Arc<dyn DurableLog>).await.unwrap());
            store.register_racer(Racer::new(Bib(42), "Test Racer", "open")).await.unwrap();
            let record = commit_timed(&store, 1, 42).await;
            // Queued but never delivered: the worker was not running.
            store.transition(record.id, SubmissionState::Queued).await.unwrap();
            record.id
        };

        let store = Arc::new(ResultStore::open(log as Arc<dyn DurableLog>).await.unwrap());
        let remote = Arc::new(FlakyRemote::new(0));
        let _pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote.clone(), &fast_config(), cancel.clone());

        wait_for_state(&store, id, SubmissionState::Acknowledged).await;
        assert_eq!(remote.accepted.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn a_burst_is_delivered_in_capture_order() {
        let store = Arc::new(ResultStore::open(Arc::new(MemoryLog::new())).await.unwrap());
        for bib in 1..=10u32 {
            store
                .register_racer(Racer::new(Bib(bib), format!("Racer {bib}"), "open"))
                .await
                .unwrap();
        }
        let remote = Arc::new(FlakyRemote::new(0));
        let cancel = CancellationToken::new();
        let pipeline =
            SubmissionPipeline::spawn(Arc::clone(&store), remote.clone(), &fast_config(), cancel.clone());

        let mut ids = Vec::new();
        for (seq, bib) in (1..=10u64).zip(1..=10u32) {
            let record = commit_timed(&store, seq, bib).await;
            pipeline.enqueue(record.id).await.unwrap();
            ids.push(record.id);
        }
        for id in &ids {
            wait_for_state(&store, *id, SubmissionState::Acknowledged).await;
        }

        let delivered: Vec<u64> = remote
            .accepted
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.time_ms as u64)
            .collect();
        let mut sorted = delivered.clone();
        sorted.sort_unstable();
        assert_eq!(delivered, sorted);
        cancel.cancel();
    }
}
