//! End-to-end delivery through a session.
//!
//! The remote here misbehaves the way event-site connectivity actually
//! does: refused connections, responses lost on the wire. The pipeline
//! must end every record in acknowledged or rejected, with exactly one
//! remote copy per result.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use latchline::{
    Bib, IdempotencyKey, MemoryLog, RaceSession, Racer, Remote, Result, ResultCategory,
    ResultPayload, StationId, SubmissionState, SubmitOutcome, SystemTimeReference, TimingConfig,
    TimingError,
};

/// Fails the first `failures` submits at the transport level, then
/// accepts. Remembers everything that landed.
struct FlakyRemote {
    failures_left: AtomicU32,
    accepted: Mutex<Vec<ResultPayload>>,
    /// When set, a failed submit still lands remotely (lost response).
    accept_on_failure: bool,
}

impl FlakyRemote {
    fn new(failures: u32) -> Self {
        FlakyRemote {
            failures_left: AtomicU32::new(failures),
            accepted: Mutex::new(Vec::new()),
            accept_on_failure: false,
        }
    }

    fn lossy(failures: u32) -> Self {
        FlakyRemote { accept_on_failure: true, ..FlakyRemote::new(failures) }
    }

    fn accepted_count(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Remote for FlakyRemote {
    async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            if self.accept_on_failure {
                self.accepted.lock().unwrap().extend_from_slice(batch);
            }
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

fn fast_config() -> TimingConfig {
    TimingConfig {
        backoff_base_ms: 5,
        backoff_cap_ms: 20,
        batch_linger_ms: 5,
        ..TimingConfig::default()
    }
}

async fn open_session(remote: Arc<FlakyRemote>) -> RaceSession {
    let session = RaceSession::open(
        StationId::new("finish-1"),
        fast_config(),
        Arc::new(MemoryLog::new()),
        Arc::new(SystemTimeReference),
        remote,
    )
    .await
    .unwrap();
    session.register_racer(Racer::new(Bib(42), "Test Racer", "open")).await.unwrap();
    session
}

async fn wait_for(session: &RaceSession, id: latchline::RecordId, state: SubmissionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if session.record(id).unwrap().state == state {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("record never reached {}", state.name()));
}

#[tokio::test]
async fn delivery_survives_transient_failures() {
    let remote = Arc::new(FlakyRemote::new(3));
    let session = open_session(Arc::clone(&remote)).await;

    let record = session.record_timed(Some(Bib(42)), ResultCategory::Finish).await.unwrap();
    session.submit(record.id).await.unwrap();

    wait_for(&session, record.id, SubmissionState::Acknowledged).await;
    assert_eq!(remote.accepted_count(), 1);
    assert_eq!(session.record(record.id).unwrap().attempts, 4);
}

#[tokio::test]
async fn lost_response_does_not_duplicate_the_result() {
    // The first submit lands remotely but its response is lost. The
    // status check must find it instead of sending a second copy.
    let remote = Arc::new(FlakyRemote::lossy(1));
    let session = open_session(Arc::clone(&remote)).await;

    let record = session.record_timed(Some(Bib(42)), ResultCategory::Finish).await.unwrap();
    session.submit(record.id).await.unwrap();

    wait_for(&session, record.id, SubmissionState::Acknowledged).await;
    assert_eq!(remote.accepted_count(), 1, "exactly one remote copy");
}

#[tokio::test]
async fn capture_keeps_working_while_the_remote_is_down() {
    let remote = Arc::new(FlakyRemote::new(u32::MAX));
    let session = open_session(Arc::clone(&remote)).await;

    // Queue one record against a dead remote, then keep capturing.
    let stuck = session.record_timed(Some(Bib(42)), ResultCategory::Finish).await.unwrap();
    session.submit(stuck.id).await.unwrap();

    let mut sequences = Vec::new();
    for _ in 0..20 {
        let event = session.capture(latchline::Trigger::Operator);
        sequences.push(event.id.sequence);
    }
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sequences.len(), sorted.len(), "capture never stalls or repeats");
}

#[tokio::test]
async fn rejected_record_can_be_corrected_and_resubmitted() {
    struct RejectOnce {
        rejections_left: AtomicU32,
        accepted: Mutex<Vec<ResultPayload>>,
    }

    #[async_trait::async_trait]
    impl Remote for RejectOnce {
        async fn submit(&self, batch: &[ResultPayload]) -> Result<Vec<SubmitOutcome>> {
            let left = self.rejections_left.load(Ordering::SeqCst);
            if left > 0 {
                self.rejections_left.store(left - 1, Ordering::SeqCst);
                return Ok(batch
                    .iter()
                    .map(|_| SubmitOutcome::Rejected { reason: "unknown bib".into() })
                    .collect());
            }
            self.accepted.lock().unwrap().extend_from_slice(batch);
            Ok(batch.iter().map(|_| SubmitOutcome::Accepted).collect())
        }

        async fn check(&self, key: &IdempotencyKey) -> Result<Option<SubmitOutcome>> {
            let seen = self.accepted.lock().unwrap().iter().any(|p| &p.key == key);
            Ok(if seen { Some(SubmitOutcome::Accepted) } else { None })
        }
    }

    let remote =
        Arc::new(RejectOnce { rejections_left: AtomicU32::new(1), accepted: Mutex::new(Vec::new()) });
    let session = RaceSession::open(
        StationId::new("finish-1"),
        fast_config(),
        Arc::new(MemoryLog::new()),
        Arc::new(SystemTimeReference),
        Arc::clone(&remote) as Arc<dyn Remote>,
    )
    .await
    .unwrap();
    session.register_racer(Racer::new(Bib(42), "Test Racer", "open")).await.unwrap();

    let record = session.record_timed(Some(Bib(42)), ResultCategory::Finish).await.unwrap();
    session.submit(record.id).await.unwrap();
    wait_for(&session, record.id, SubmissionState::Rejected).await;

    // Operator fixes the roster upstream and queues the same record again.
    session.submit(record.id).await.unwrap();
    wait_for(&session, record.id, SubmissionState::Acknowledged).await;
    assert_eq!(remote.accepted.lock().unwrap().len(), 1);
}
