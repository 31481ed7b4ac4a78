use data_model::{SandboxDirectories, TaskId};
use syncer_utils::SerialActor;
use tokio::sync::watch;

/// In-memory task id -> sandbox directory mappings that have not been
/// persisted yet.
///
/// All mutations go through a single writer and are applied in the order
/// they were submitted. A task's directory is never replaced: the first
/// report wins and later ones are ignored. Entries only leave through
/// `drain_matching`, after the durable store has confirmed them.
#[derive(Clone)]
pub struct SandboxAggregator {
    actor: SerialActor<SandboxDirectories>,
}

impl Default for SandboxAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxAggregator {
    pub fn new() -> Self {
        Self {
            actor: SerialActor::spawn("sandbox_aggregator", SandboxDirectories::new()),
        }
    }

    /// Adds every mapping whose task id is not already present.
    pub fn merge(&self, updates: SandboxDirectories) {
        if updates.is_empty() {
            return;
        }
        self.actor.send(move |directories| {
            for (task_id, directory) in updates {
                directories.entry(task_id).or_insert(directory);
            }
        });
    }

    pub fn merge_one(&self, task_id: TaskId, directory: String) {
        self.merge(SandboxDirectories::unit(task_id, directory));
    }

    /// Removes the mappings of `published` that still hold the published
    /// value. Anything that changed or disappeared since is left alone.
    pub fn drain_matching(&self, published: SandboxDirectories) {
        if published.is_empty() {
            return;
        }
        self.actor.send(move |directories| {
            for (task_id, directory) in published.iter() {
                if directories.get(task_id) == Some(directory) {
                    directories.remove(task_id);
                }
            }
        });
    }

    pub fn snapshot(&self) -> SandboxDirectories {
        self.actor.snapshot()
    }

    /// Number of mappings waiting to be persisted.
    pub fn pending_count(&self) -> usize {
        self.actor.subscribe().borrow().len()
    }

    /// Resolves once every merge and drain submitted before the call has
    /// been applied.
    pub async fn await_applied(&self) {
        self.actor.await_applied().await
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxDirectories> {
        self.actor.subscribe()
    }
}
