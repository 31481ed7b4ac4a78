use std::{future::Future, sync::Arc, time::Duration};

use data_model::{FrameworkId, SandboxDirectories};
use opentelemetry::KeyValue;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use super::{
    agent_cache::{AgentQueryCache, QueryHandle},
    agent_client::{AgentQuery, QueryError},
    aggregator::SandboxAggregator,
    pending_sync::PendingSyncTracker,
    LoopHandle,
};
use crate::metrics::{sandbox_syncer::Metrics, Timer};

/// Queries agents for the sandbox directories of their tasks and folds the
/// results into the aggregator.
///
/// A successful query merges what the agent reported and clears the host
/// from the pending-sync set. A failed one puts the host back so the next
/// tick queries it again.
pub struct HostSync {
    aggregator: SandboxAggregator,
    pending_sync: PendingSyncTracker,
    agent_cache: Arc<AgentQueryCache>,
    agent_query: Arc<dyn AgentQuery>,
    metrics: Arc<Metrics>,
}

impl HostSync {
    pub fn new(
        aggregator: SandboxAggregator,
        pending_sync: PendingSyncTracker,
        agent_cache: Arc<AgentQueryCache>,
        agent_query: Arc<dyn AgentQuery>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator,
            pending_sync,
            agent_cache,
            agent_query,
            metrics,
        }
    }

    /// Returns the query for `hostname`, starting one if the host has no
    /// live cache entry. The query applies its own outcome when it
    /// completes, so a cached hit changes nothing.
    pub fn sync_host(&self, framework_id: &FrameworkId, hostname: &str) -> QueryHandle {
        self.agent_cache
            .lookup_or_dispatch(hostname, || {
                self.query_and_apply(framework_id.clone(), hostname.to_string())
            })
            .into_handle()
    }

    /// Queries `hostname` again unless a query to it is still running.
    pub fn refresh_host(&self, framework_id: &FrameworkId, hostname: &str) -> QueryHandle {
        self.agent_cache
            .refresh(hostname, || {
                self.query_and_apply(framework_id.clone(), hostname.to_string())
            })
            .into_handle()
    }

    /// One pass over the pending-sync set. Does nothing until a framework
    /// id is known. Returns the number of hosts visited.
    pub fn sync_pending_hosts(&self) -> usize {
        let Some(framework_id) = self.pending_sync.framework_id() else {
            debug!("framework id not known yet, skipping host sync");
            return 0;
        };
        let hosts = self.pending_sync.current_hosts();
        for hostname in hosts.iter() {
            self.refresh_host(&framework_id, hostname);
        }
        if !hosts.is_empty() {
            debug!(hosts = hosts.len(), "synced pending hosts");
        }
        hosts.len()
    }

    fn query_and_apply(
        &self,
        framework_id: FrameworkId,
        hostname: String,
    ) -> impl Future<Output = Result<SandboxDirectories, QueryError>> + Send + 'static {
        let agent_query = self.agent_query.clone();
        let aggregator = self.aggregator.clone();
        let pending_sync = self.pending_sync.clone();
        let metrics = self.metrics.clone();
        async move {
            let result = {
                let _timer = Timer::start(&metrics.agent_query_duration);
                agent_query.query_agent(&framework_id, &hostname).await
            };
            let outcome = if result.is_ok() { "success" } else { "failure" };
            metrics
                .agent_queries
                .add(1, &[KeyValue::new("outcome", outcome)]);

            match &result {
                Ok(directories) => {
                    aggregator.merge(directories.clone());
                    pending_sync.remove(&hostname);
                }
                Err(_) => pending_sync.add(&hostname),
            }
            // the handle resolves only after the outcome is visible
            aggregator.await_applied().await;
            pending_sync.await_applied().await;
            result
        }
    }

    /// Spawns the periodic sync loop.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> LoopHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let join_handle = tokio::spawn(self.start(interval, shutdown_rx));
        LoopHandle::new("host_sync", shutdown_tx, join_handle)
    }

    async fn start(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<()>) {
        info!(?interval, "starting host sync loop");
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("host sync loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }
            self.sync_pending_hosts();
        }
    }
}
