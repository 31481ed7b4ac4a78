use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use state_store::RocksDBSandboxStore;
use tokio::signal;
use tracing::{error, info};

use crate::{
    config::SyncerConfig,
    metrics::init_provider,
    routes::{create_routes, RouteState},
    sandbox::{AgentClient, AgentQuery, SandboxSyncer},
};

pub struct Service {
    pub config: SyncerConfig,
    pub store: Arc<RocksDBSandboxStore>,
    pub agent_query: Arc<dyn AgentQuery>,
}

impl Service {
    pub fn new(config: SyncerConfig) -> Result<Self> {
        let agent_client =
            AgentClient::new(&config.agent).context("error initializing agent client")?;
        Self::with_agent_query(config, Arc::new(agent_client))
    }

    pub fn with_agent_query(config: SyncerConfig, agent_query: Arc<dyn AgentQuery>) -> Result<Self> {
        let store = Arc::new(
            RocksDBSandboxStore::open(PathBuf::from(&config.state_store_path))
                .context("error opening state store")?,
        );
        Ok(Self {
            config,
            store,
            agent_query,
        })
    }

    pub fn start_syncer(&self) -> SandboxSyncer {
        SandboxSyncer::start(&self.config, self.agent_query.clone(), self.store.clone())
    }

    /// Serves the HTTP API for `syncer` until `handle` is shut down.
    pub async fn serve(&self, syncer: Arc<SandboxSyncer>, handle: Handle) -> Result<()> {
        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("sandbox syncer api listening on {}", self.config.listen_addr);
        let routes = create_routes(RouteState {
            syncer,
            store: self.store.clone(),
            agent_port: self.config.agent.port,
        });
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;
        Ok(())
    }

    /// Runs until SIGINT or SIGTERM, then stops the API and the syncer loops.
    pub async fn start(&self) -> Result<()> {
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval,
            &self.config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )?;

        let syncer = Arc::new(self.start_syncer());
        info!(
            state_store_path = self.config.state_store_path,
            agent_port = self.config.agent.port,
            "sandbox syncer service running"
        );

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, stopping sandbox syncer");
        });

        let served = self.serve(syncer.clone(), handle).await;
        syncer.shutdown().await;
        served
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
}
