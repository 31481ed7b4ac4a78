//! Discovery, aggregation and persistence of task sandbox directories.
//!
//! Two loops run independently. The host sync loop queries agents that are
//! pending a sync and merges what they report into the aggregator. The
//! publisher loop drains the aggregator into the durable store.

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::error;

pub mod agent_cache;
pub mod agent_client;
pub mod aggregator;
pub mod host_sync;
pub mod pending_sync;
pub mod publisher;
pub mod syncer;

pub use agent_client::{AgentClient, AgentQuery};
pub use syncer::SandboxSyncer;

/// Handle to a background loop.
///
/// Cancelling stops the loop from scheduling further ticks. A tick that is
/// already running finishes, and queries it dispatched keep running.
pub struct LoopHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<()>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoopHandle {
    pub(crate) fn new(
        name: &'static str,
        shutdown_tx: watch::Sender<()>,
        join_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown_tx,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    pub fn cancel(&self) {
        // the loop may already be gone
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the loop task to exit.
    pub async fn stopped(&self) {
        let mut join_handle = self.join_handle.lock().await;
        if let Some(handle) = join_handle.take() {
            if let Err(err) = handle.await {
                error!(name = self.name, "background loop failed: {:?}", err);
            }
        }
    }
}
