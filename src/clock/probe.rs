//! The periodic clock-probe task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reference::TimeReference;
use super::trust::{ClockTrust, TrustSnapshot};
use crate::config::TimingConfig;
use crate::error::Result;
use crate::types::ClockSample;

/// Spawns and runs the reference-clock probe loop.
///
/// The prober owns the [`ClockTrust`] window and publishes a fresh
/// [`TrustSnapshot`] over a watch channel after every cycle, success or
/// failure. Capture reads the channel; it never waits on a probe.
pub struct ClockProber;

impl ClockProber {
    /// Spawn the probe task for the given reference.
    ///
    /// The task stops when `cancel` fires. The returned receiver always
    /// holds the latest snapshot and starts out untrusted.
    pub fn spawn(
        reference: Arc<dyn TimeReference>,
        config: &TimingConfig,
        cancel: CancellationToken,
    ) -> watch::Receiver<TrustSnapshot> {
        let (tx, rx) = watch::channel(TrustSnapshot::untrusted());
        let config = config.clone();

        tokio::spawn(async move {
            Self::probe_task(reference, config, tx, cancel).await;
        });

        rx
    }

    /// One round trip against the reference.
    ///
    /// The local timestamp is taken at the midpoint of the call, so the
    /// offset error is bounded by half the round trip.
    pub async fn sample(reference: &dyn TimeReference) -> Result<ClockSample> {
        let before = super::wall_clock_ms();
        let reference_ms = reference.reference_ms().await?;
        let after = super::wall_clock_ms();

        Ok(ClockSample {
            local_ms: before + (after - before) / 2,
            reference_ms,
            round_trip: Duration::from_millis((after - before).max(0) as u64),
        })
    }

    async fn probe_task(
        reference: Arc<dyn TimeReference>,
        config: TimingConfig,
        tx: watch::Sender<TrustSnapshot>,
        cancel: CancellationToken,
    ) {
        info!(interval_ms = config.probe_interval_ms, "clock probe task started");

        let mut trust = ClockTrust::new(&config);
        // Well past the acceptance threshold; a slower probe is useless.
        let probe_deadline = config.max_round_trip() * 4;
        let mut ticker = tokio::time::interval(config.probe_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("clock probe task cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match tokio::time::timeout(probe_deadline, Self::sample(reference.as_ref())).await {
                Ok(Ok(sample)) => {
                    trust.accept(sample);
                }
                Ok(Err(e)) => {
                    // Non-fatal: retried next interval, capture continues.
                    warn!(error = %e, "clock probe failed");
                }
                Err(_) => {
                    warn!(deadline_ms = probe_deadline.as_millis() as u64, "clock probe timed out");
                }
            }

            let snapshot = trust.snapshot();
            debug!(offset_ms = snapshot.offset_ms, trust = ?snapshot.trust, "published clock snapshot");
            if tx.send(snapshot).is_err() {
                debug!("trust receiver dropped, stopping probe task");
                break;
            }
        }
    }
}
