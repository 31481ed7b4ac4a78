use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use data_model::{TaskId, TaskInstance};
use tokio::sync::Mutex;

use crate::{BatchOutcome, Error, SandboxStore};

/// Store backed by a map, for tests and local runs. Writes can be made to
/// fail on demand to exercise the publisher's retry path.
#[derive(Default)]
pub struct InMemorySandboxStore {
    instances: Mutex<HashMap<TaskId, TaskInstance>>,
    failing_writes: AtomicUsize,
    committed_batches: AtomicUsize,
}

impl InMemorySandboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_task_instance(&self, instance: TaskInstance) {
        self.instances
            .lock()
            .await
            .insert(instance.task_id.clone(), instance);
    }

    pub async fn get_task_instance(&self, task_id: &TaskId) -> Option<TaskInstance> {
        self.instances.lock().await.get(task_id).cloned()
    }

    /// The next `count` calls to `write_sandboxes` fail without writing.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn committed_batches(&self) -> usize {
        self.committed_batches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxStore for InMemorySandboxStore {
    async fn exists(&self, task_id: &TaskId) -> Result<bool, Error> {
        Ok(self.instances.lock().await.contains_key(task_id))
    }

    async fn has_sandbox(&self, task_id: &TaskId) -> Result<bool, Error> {
        Ok(self
            .instances
            .lock()
            .await
            .get(task_id)
            .is_some_and(|instance| instance.has_sandbox()))
    }

    async fn write_sandboxes(&self, batch: &[(TaskId, String)]) -> Result<BatchOutcome, Error> {
        if self.take_failure() {
            return Err(Error::WriteRejected {
                reason: "injected failure".to_string(),
            });
        }

        let mut instances = self.instances.lock().await;
        let mut outcome = BatchOutcome::default();
        for (task_id, directory) in batch {
            match instances.get_mut(task_id) {
                None => outcome.missing += 1,
                Some(instance) if instance.has_sandbox() => outcome.already_recorded += 1,
                Some(instance) => {
                    instance.sandbox_directory = Some(directory.clone());
                    outcome.written.push(task_id.clone());
                }
            }
        }
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_task_instance, random_task_id};

    use super::*;

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = InMemorySandboxStore::new();
        let task_id = random_task_id();
        store
            .upsert_task_instance(mock_task_instance(&task_id, None))
            .await;
        store.fail_next_writes(1);

        let batch = [(task_id.clone(), "/sandbox".to_string())];
        let err = store.write_sandboxes(&batch).await.unwrap_err();
        assert!(matches!(err, Error::WriteRejected { .. }));
        assert!(!store.has_sandbox(&task_id).await.unwrap());

        let outcome = store.write_sandboxes(&batch).await.unwrap();
        assert_eq!(outcome.written, vec![task_id.clone()]);
        assert_eq!(store.committed_batches(), 1);
    }
}
