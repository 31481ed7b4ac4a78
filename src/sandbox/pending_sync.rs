use data_model::FrameworkId;
use syncer_utils::SerialActor;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PendingSyncState {
    /// Framework to look for in agent state. Unknown until the scheduler
    /// has registered.
    pub framework_id: Option<FrameworkId>,
    /// Hosts whose sandbox data is not known to be fresh.
    pub hosts: im::HashSet<String>,
}

/// Hosts that must be queried (again). A host is added when it has never
/// been queried, when its last query failed or when its cache entry was
/// evicted, and removed once a query succeeds.
#[derive(Clone)]
pub struct PendingSyncTracker {
    actor: SerialActor<PendingSyncState>,
}

impl PendingSyncTracker {
    pub fn new(framework_id: Option<FrameworkId>) -> Self {
        Self {
            actor: SerialActor::spawn(
                "pending_sync_tracker",
                PendingSyncState {
                    framework_id,
                    hosts: im::HashSet::new(),
                },
            ),
        }
    }

    pub fn add(&self, hostname: &str) {
        let hostname = hostname.to_string();
        self.actor.send(move |state| {
            if state.hosts.insert(hostname.clone()).is_none() {
                debug!(hostname = %hostname, "host pending sandbox sync");
            }
        });
    }

    pub fn remove(&self, hostname: &str) {
        let hostname = hostname.to_string();
        self.actor.send(move |state| {
            state.hosts.remove(&hostname);
        });
    }

    pub fn set_framework_id(&self, framework_id: FrameworkId) {
        self.actor.send(move |state| {
            if state.framework_id.as_ref() != Some(&framework_id) {
                debug!(%framework_id, "framework id updated");
                state.framework_id = Some(framework_id);
            }
        });
    }

    pub fn current_hosts(&self) -> im::HashSet<String> {
        self.actor.snapshot().hosts
    }

    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.actor.subscribe().borrow().framework_id.clone()
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.actor.subscribe().borrow().hosts.contains(hostname)
    }

    pub fn len(&self) -> usize {
        self.actor.subscribe().borrow().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn await_applied(&self) {
        self.actor.await_applied().await
    }

    pub fn subscribe(&self) -> watch::Receiver<PendingSyncState> {
        self.actor.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let tracker = PendingSyncTracker::new(None);
        tracker.add("h1");
        tracker.add("h1");
        tracker.add("h2");
        tracker.remove("h2");
        tracker.remove("h2");
        tracker.remove("h3");
        tracker.await_applied().await;

        assert_eq!(tracker.current_hosts(), im::HashSet::unit("h1".to_string()));
        assert!(tracker.contains("h1"));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_framework_id_is_replaced() {
        let tracker = PendingSyncTracker::new(Some(FrameworkId::from("old")));
        assert_eq!(tracker.framework_id(), Some(FrameworkId::from("old")));

        tracker.set_framework_id(FrameworkId::from("new"));
        tracker.await_applied().await;
        assert_eq!(tracker.framework_id(), Some(FrameworkId::from("new")));
    }
}
