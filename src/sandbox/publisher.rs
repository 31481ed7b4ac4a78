use std::{sync::Arc, time::Duration};

use data_model::{SandboxDirectories, TaskId};
use opentelemetry::KeyValue;
use state_store::SandboxStore;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

use super::{aggregator::SandboxAggregator, LoopHandle};
use crate::metrics::{sandbox_syncer::Metrics, Timer};

/// Totals of one publish pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub written: usize,
    pub already_recorded: usize,
    pub missing: usize,
    pub failed_batches: usize,
}

impl PublishReport {
    /// Entries that left the aggregator.
    pub fn drained(&self) -> usize {
        self.written + self.already_recorded + self.missing
    }
}

/// Moves aggregated sandbox directories into the durable store.
///
/// Each pass writes a snapshot of the aggregator in batches of at most
/// `batch_size`, one transaction per batch. Entries of committed batches
/// are drained whether they were written, already recorded or had no task
/// record. Entries of a batch that failed stay in the aggregator for the
/// next pass.
pub struct SandboxPublisher {
    aggregator: SandboxAggregator,
    store: Arc<dyn SandboxStore>,
    batch_size: usize,
    metrics: Arc<Metrics>,
}

impl SandboxPublisher {
    pub fn new(
        aggregator: SandboxAggregator,
        store: Arc<dyn SandboxStore>,
        batch_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator,
            store,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    pub async fn publish(&self) -> PublishReport {
        let snapshot = self.aggregator.snapshot();
        let mut report = PublishReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let _timer = Timer::start(&self.metrics.publish_duration);
        let entries: Vec<(TaskId, String)> = snapshot.into_iter().collect();
        let mut published = SandboxDirectories::new();
        for batch in entries.chunks(self.batch_size) {
            match self.store.write_sandboxes(batch).await {
                Ok(outcome) => {
                    report.written += outcome.written.len();
                    report.already_recorded += outcome.already_recorded;
                    report.missing += outcome.missing;
                    published.extend(batch.iter().cloned());
                }
                Err(err) => {
                    error!(
                        batch_size = batch.len(),
                        "failed to persist sandbox directories: {:?}", err
                    );
                    report.failed_batches += 1;
                    self.metrics.publish_batch_failures.add(1, &[]);
                }
            }
        }
        self.aggregator.drain_matching(published);

        self.record(&report);
        if report.failed_batches > 0 || report.written > 0 {
            info!(
                written = report.written,
                already_recorded = report.already_recorded,
                missing = report.missing,
                failed_batches = report.failed_batches,
                "published sandbox directories"
            );
        } else {
            debug!(drained = report.drained(), "nothing new to publish");
        }
        report
    }

    fn record(&self, report: &PublishReport) {
        for (result, count) in [
            ("written", report.written),
            ("already_recorded", report.already_recorded),
            ("missing", report.missing),
        ] {
            if count > 0 {
                self.metrics
                    .sandboxes_published
                    .add(count as u64, &[KeyValue::new("result", result)]);
            }
        }
    }

    /// Spawns the periodic publish loop.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> LoopHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let join_handle = tokio::spawn(self.start(interval, shutdown_rx));
        LoopHandle::new("publisher", shutdown_tx, join_handle)
    }

    async fn start(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<()>) {
        info!(?interval, batch_size = self.batch_size, "starting publisher loop");
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("publisher loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }
            self.publish().await;
        }
    }
}
