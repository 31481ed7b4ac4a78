use std::sync::Arc;

use data_model::{FrameworkId, SandboxReport};
use opentelemetry::KeyValue;
use state_store::SandboxStore;
use tracing::{debug, info};

use super::{
    agent_cache::{AgentQueryCache, QueryHandle},
    agent_client::AgentQuery,
    aggregator::SandboxAggregator,
    host_sync::HostSync,
    pending_sync::PendingSyncTracker,
    publisher::{PublishReport, SandboxPublisher},
    LoopHandle,
};
use crate::{
    config::SyncerConfig,
    metrics::sandbox_syncer::{Gauges, Metrics},
};

/// Owns the sandbox sync components and their two background loops.
pub struct SandboxSyncer {
    aggregator: SandboxAggregator,
    pending_sync: PendingSyncTracker,
    agent_cache: Arc<AgentQueryCache>,
    host_sync: Arc<HostSync>,
    publisher: Arc<SandboxPublisher>,
    metrics: Arc<Metrics>,
    host_sync_loop: LoopHandle,
    publisher_loop: LoopHandle,
    _gauges: Gauges,
}

impl SandboxSyncer {
    /// Builds every component and starts both loops on the current runtime.
    pub fn start(
        config: &SyncerConfig,
        agent_query: Arc<dyn AgentQuery>,
        store: Arc<dyn SandboxStore>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let aggregator = SandboxAggregator::new();
        let pending_sync = PendingSyncTracker::new(config.framework_id.clone());
        let agent_cache = Arc::new(AgentQueryCache::new(
            config.agent_query_cache.max_size,
            config.agent_query_cache.ttl(),
            pending_sync.clone(),
            metrics.clone(),
        ));
        let host_sync = Arc::new(HostSync::new(
            aggregator.clone(),
            pending_sync.clone(),
            agent_cache.clone(),
            agent_query,
            metrics.clone(),
        ));
        let publisher = Arc::new(SandboxPublisher::new(
            aggregator.clone(),
            store,
            config.publisher.batch_size,
            metrics.clone(),
        ));

        let gauges = {
            let pending_sandboxes = aggregator.subscribe();
            let pending_hosts = pending_sync.subscribe();
            Gauges::new(
                move || pending_sandboxes.borrow().len() as u64,
                move || pending_hosts.borrow().hosts.len() as u64,
            )
        };

        for hostname in &config.host_sync.hosts {
            pending_sync.add(hostname);
        }

        let host_sync_loop = host_sync.clone().spawn(config.host_sync.interval);
        let publisher_loop = publisher.clone().spawn(config.publisher.interval);
        info!(
            framework_id = ?config.framework_id,
            cache_size = config.agent_query_cache.max_size,
            seeded_hosts = config.host_sync.hosts.len(),
            "sandbox syncer started"
        );

        Self {
            aggregator,
            pending_sync,
            agent_cache,
            host_sync,
            publisher,
            metrics,
            host_sync_loop,
            publisher_loop,
            _gauges: gauges,
        }
    }

    /// Records a sandbox directory a task reported itself. Tasks already
    /// waiting to be published keep their first directory.
    pub fn update_sandbox(&self, report: SandboxReport) {
        debug!(
            task_id = %report.task_id,
            report_type = %report.report_type,
            "sandbox reported"
        );
        self.metrics.sandbox_reports.add(
            1,
            &[KeyValue::new("report_type", report.report_type.to_string())],
        );
        self.aggregator
            .merge_one(report.task_id, report.sandbox_directory);
    }

    /// Registers `framework_id` as the framework to look for and returns the
    /// query for `hostname`, reusing a cached one when it is still live.
    pub fn sync_agent_sandboxes(&self, framework_id: FrameworkId, hostname: &str) -> QueryHandle {
        self.pending_sync.set_framework_id(framework_id.clone());
        self.host_sync.sync_host(&framework_id, hostname)
    }

    /// Schedules `hostname` for the next host sync pass.
    pub fn request_host_sync(&self, hostname: &str) {
        self.pending_sync.add(hostname);
    }

    /// Runs a publish pass right away, outside of the publisher loop.
    pub async fn publish_now(&self) -> PublishReport {
        self.publisher.publish().await
    }

    pub fn aggregator(&self) -> &SandboxAggregator {
        &self.aggregator
    }

    pub fn pending_sync(&self) -> &PendingSyncTracker {
        &self.pending_sync
    }

    pub fn agent_cache(&self) -> &AgentQueryCache {
        &self.agent_cache
    }

    /// Stops both loops. Ticks in progress finish and queries already
    /// dispatched keep running until they complete.
    pub async fn shutdown(&self) {
        self.host_sync_loop.cancel();
        self.publisher_loop.cancel();
        self.host_sync_loop.stopped().await;
        self.publisher_loop.stopped().await;
        info!("sandbox syncer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{
            mock_sandbox_directories,
            mock_task_instance,
            random_task_id,
            TEST_FRAMEWORK_ID,
        },
        ReportType,
        SandboxDirectories,
    };
    use state_store::InMemorySandboxStore;

    use super::*;
    use crate::{
        sandbox::agent_cache::QueryState,
        testing::{test_config, wait_until, MockAgentQuery},
    };

    #[tokio::test]
    async fn test_reported_sandbox_is_published() {
        let task_id = random_task_id();
        let store = Arc::new(InMemorySandboxStore::new());
        store
            .upsert_task_instance(mock_task_instance(&task_id, None))
            .await;
        let mut config = test_config();
        config.publisher.interval = Duration::from_secs(3600);
        let syncer =
            SandboxSyncer::start(&config, Arc::new(MockAgentQuery::new()), store.clone());

        syncer.update_sandbox(SandboxReport::new(
            task_id.clone(),
            "/sandbox/first".to_string(),
            ReportType::StatusUpdate,
        ));
        syncer.update_sandbox(SandboxReport::new(
            task_id.clone(),
            "/sandbox/second".to_string(),
            ReportType::FrameworkMessage,
        ));
        syncer.aggregator().await_applied().await;
        assert_eq!(
            syncer.aggregator().snapshot().get(&task_id),
            Some(&"/sandbox/first".to_string())
        );

        let report = syncer.publish_now().await;
        syncer.aggregator().await_applied().await;
        syncer.shutdown().await;

        assert_eq!(report.written, 1);
        let instance = store.get_task_instance(&task_id).await.unwrap();
        assert_eq!(instance.sandbox_directory.as_deref(), Some("/sandbox/first"));
    }

    #[tokio::test]
    async fn test_reported_and_queried_sandboxes_are_both_kept() {
        let agents = Arc::new(MockAgentQuery::new());
        let queried = mock_sandbox_directories("h1", 3);
        agents.with_agent("h1", queried.clone());
        let mut config = test_config();
        config.publisher.interval = Duration::from_secs(3600);
        let syncer = SandboxSyncer::start(&config, agents, Arc::new(InMemorySandboxStore::new()));

        let task_id = random_task_id();
        syncer.update_sandbox(SandboxReport::new(
            task_id.clone(),
            "/sandbox/reported".to_string(),
            ReportType::StatusUpdate,
        ));
        let handle = syncer.sync_agent_sandboxes(FrameworkId::from(TEST_FRAMEWORK_ID), "h1");
        handle.wait().await;
        syncer.aggregator().await_applied().await;

        let mut expected = queried;
        expected.insert(task_id, "/sandbox/reported".to_string());
        assert_eq!(syncer.aggregator().snapshot(), expected);
        syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_agent_sandboxes_queries_agent_once() {
        let agents = Arc::new(MockAgentQuery::new());
        let directories = mock_sandbox_directories("h1", 4);
        agents.with_agent("h1", directories.clone());
        let syncer = SandboxSyncer::start(
            &test_config(),
            agents.clone(),
            Arc::new(InMemorySandboxStore::new()),
        );
        let framework_id = FrameworkId::from(TEST_FRAMEWORK_ID);

        let first = syncer.sync_agent_sandboxes(framework_id.clone(), "h1");
        let second = syncer.sync_agent_sandboxes(framework_id.clone(), "h1");
        assert!(first.same_query(&second));
        assert_eq!(second.wait().await, QueryState::Success(directories.clone()));

        syncer.pending_sync().await_applied().await;
        assert_eq!(syncer.pending_sync().framework_id(), Some(framework_id));
        assert_eq!(agents.query_count("h1"), 1);
        syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_requested_host_is_synced_in_background() {
        let agents = Arc::new(MockAgentQuery::new());
        let directories = mock_sandbox_directories("h1", 2);
        agents.with_agent("h1", directories.clone());
        let mut config = test_config();
        config.framework_id = Some(FrameworkId::from(TEST_FRAMEWORK_ID));
        // keep the publisher from draining what the host sync loop finds
        config.publisher.interval = Duration::from_secs(3600);
        let syncer =
            SandboxSyncer::start(&config, agents.clone(), Arc::new(InMemorySandboxStore::new()));

        syncer.request_host_sync("h1");
        let synced = wait_until(Duration::from_secs(5), || {
            syncer.agent_cache().contains("h1") && syncer.aggregator().pending_count() == 2
        })
        .await;

        assert!(synced);
        assert_eq!(syncer.aggregator().snapshot(), directories);
        syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_hosts_are_pending_at_start() {
        let mut config = test_config();
        config.host_sync.hosts = vec!["h1".to_string(), "h2".to_string()];
        let syncer = SandboxSyncer::start(
            &config,
            Arc::new(MockAgentQuery::new()),
            Arc::new(InMemorySandboxStore::new()),
        );

        syncer.pending_sync().await_applied().await;
        assert!(syncer.pending_sync().contains("h1"));
        assert!(syncer.pending_sync().contains("h2"));
        syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_lets_dispatched_queries_finish() {
        let agents = Arc::new(MockAgentQuery::new());
        agents.with_agent("h1", SandboxDirectories::new());
        agents.hold_queries();
        let syncer = SandboxSyncer::start(
            &test_config(),
            agents.clone(),
            Arc::new(InMemorySandboxStore::new()),
        );

        let handle = syncer.sync_agent_sandboxes(FrameworkId::from(TEST_FRAMEWORK_ID), "h1");
        syncer.shutdown().await;
        assert!(handle.is_pending());

        agents.release_queries();
        assert_eq!(
            handle.wait().await,
            QueryState::Success(SandboxDirectories::new())
        );
    }
}
