use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{FrameworkId, SandboxDirectories};
use reqwest::StatusCode;
use tokio::sync::watch;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::SyncerConfig,
    sandbox::agent_client::{AgentQuery, QueryError},
    service::Service,
};

/// Scripted agents keyed by hostname. Unknown hosts answer 404.
pub struct MockAgentQuery {
    agents: Mutex<HashMap<String, Option<SandboxDirectories>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    released_tx: watch::Sender<bool>,
}

impl MockAgentQuery {
    pub fn new() -> Self {
        let (released_tx, _) = watch::channel(true);
        Self {
            agents: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            released_tx,
        }
    }

    pub fn with_agent(&self, hostname: &str, directories: SandboxDirectories) {
        self.agents
            .lock()
            .unwrap()
            .insert(hostname.to_string(), Some(directories));
    }

    /// Makes `hostname` answer with a server error.
    pub fn fail_agent(&self, hostname: &str) {
        self.agents.lock().unwrap().insert(hostname.to_string(), None);
    }

    /// Queries block until `release_queries` is called.
    pub fn hold_queries(&self) {
        self.released_tx.send_replace(false);
    }

    pub fn release_queries(&self) {
        self.released_tx.send_replace(true);
    }

    pub fn query_count(&self, hostname: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(hostname)
            .copied()
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentQuery for MockAgentQuery {
    async fn query_agent(
        &self,
        _framework_id: &FrameworkId,
        hostname: &str,
    ) -> Result<SandboxDirectories, QueryError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(hostname.to_string())
            .or_default() += 1;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut released_rx = self.released_tx.subscribe();
        let _ = released_rx.wait_for(|released| *released).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let agent = self.agents.lock().unwrap().get(hostname).cloned();
        match agent {
            Some(Some(directories)) => Ok(directories),
            Some(None) => Err(QueryError::UnexpectedStatus {
                hostname: hostname.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            }),
            None => Err(QueryError::UnexpectedStatus {
                hostname: hostname.to_string(),
                status: StatusCode::NOT_FOUND,
            }),
        }
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Config with loop intervals short enough for tests.
pub fn test_config() -> SyncerConfig {
    let mut config = SyncerConfig::default();
    config.publisher.interval = Duration::from_millis(20);
    config.publisher.batch_size = 8;
    config.host_sync.interval = Duration::from_millis(20);
    config.agent_query_cache.max_size = 16;
    config
}

pub struct TestService {
    pub service: Service,
    pub agents: Arc<MockAgentQuery>,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub fn new(config: SyncerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = SyncerConfig {
            state_store_path: temp_dir
                .path()
                .join("state_store")
                .to_str()
                .unwrap()
                .to_string(),
            ..config
        };
        let agents = Arc::new(MockAgentQuery::new());
        let service = Service::with_agent_query(config, agents.clone())?;

        Ok(Self {
            service,
            agents,
            _temp_dir: temp_dir,
        })
    }
}
