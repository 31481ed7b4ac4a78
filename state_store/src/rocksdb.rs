use std::{fs, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use data_model::{TaskId, TaskInstance};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use strum::{AsRefStr, IntoEnumIterator};
use tracing::{debug, info};

use crate::{
    serializer::{JsonEncode, JsonEncoder},
    BatchOutcome,
    Error,
    SandboxStore,
};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum SandboxStoreColumns {
    TaskInstances, //  TaskId -> TaskInstance
}

/// Task instance records kept in a RocksDB transaction database.
pub struct RocksDBSandboxStore {
    db: Arc<TransactionDB>,
}

impl RocksDBSandboxStore {
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&path).map_err(|source| Error::CreateDirFailed { source })?;

        let column_families = SandboxStoreColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            &path,
            column_families,
        )
        .map_err(|source| Error::OpenDatabaseFailed { source })?;
        info!(path = %path.display(), "opened sandbox state store");

        Ok(Self { db: Arc::new(db) })
    }

    fn column_family(&self, column: SandboxStoreColumns) -> Result<&ColumnFamily, Error> {
        self.db
            .cf_handle(column.as_ref())
            .ok_or_else(|| Error::MissingColumnFamily {
                name: column.to_string(),
            })
    }

    /// Creates or replaces an instance record. The scheduler writes these
    /// when it launches a task.
    pub fn upsert_task_instance(&self, instance: &TaskInstance) -> Result<(), Error> {
        let cf = self.column_family(SandboxStoreColumns::TaskInstances)?;
        let serialized = JsonEncoder::encode(instance)?;
        self.db.put_cf(cf, instance.key(), serialized)?;
        Ok(())
    }

    pub fn get_task_instance(&self, task_id: &TaskId) -> Result<Option<TaskInstance>, Error> {
        let cf = self.column_family(SandboxStoreColumns::TaskInstances)?;
        self.db
            .get_cf(cf, task_id.get())?
            .map(|bytes| JsonEncoder::decode::<TaskInstance>(&bytes))
            .transpose()
    }
}

#[async_trait]
impl SandboxStore for RocksDBSandboxStore {
    async fn exists(&self, task_id: &TaskId) -> Result<bool, Error> {
        Ok(self.get_task_instance(task_id)?.is_some())
    }

    async fn has_sandbox(&self, task_id: &TaskId) -> Result<bool, Error> {
        Ok(self
            .get_task_instance(task_id)?
            .is_some_and(|instance| instance.has_sandbox()))
    }

    async fn write_sandboxes(&self, batch: &[(TaskId, String)]) -> Result<BatchOutcome, Error> {
        let cf = self.column_family(SandboxStoreColumns::TaskInstances)?;
        let txn = self.db.transaction();
        let mut outcome = BatchOutcome::default();

        for (task_id, directory) in batch {
            let Some(existing) = txn.get_for_update_cf(cf, task_id.get(), true)? else {
                debug!(task_id = %task_id, "no instance record for sandbox, skipping");
                outcome.missing += 1;
                continue;
            };
            let mut instance = JsonEncoder::decode::<TaskInstance>(&existing)?;
            if instance.has_sandbox() {
                outcome.already_recorded += 1;
                continue;
            }
            instance.sandbox_directory = Some(directory.clone());
            txn.put_cf(cf, task_id.get(), JsonEncoder::encode(&instance)?)?;
            outcome.written.push(task_id.clone());
        }

        txn.commit()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_task_instance, random_task_id};

    use super::*;

    fn open_store() -> (tempfile::TempDir, RocksDBSandboxStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RocksDBSandboxStore::open(temp_dir.path().join("state")).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_write_only_fills_missing_sandboxes() {
        let (_dir, store) = open_store();
        let fresh = random_task_id();
        let recorded = random_task_id();
        let unknown = random_task_id();
        store
            .upsert_task_instance(&mock_task_instance(&fresh, None))
            .unwrap();
        store
            .upsert_task_instance(&mock_task_instance(&recorded, Some("/old".to_string())))
            .unwrap();

        let outcome = store
            .write_sandboxes(&[
                (fresh.clone(), "/new/fresh".to_string()),
                (recorded.clone(), "/new/recorded".to_string()),
                (unknown.clone(), "/new/unknown".to_string()),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.written, vec![fresh.clone()]);
        assert_eq!(outcome.already_recorded, 1);
        assert_eq!(outcome.missing, 1);
        assert_eq!(outcome.len(), 3);

        let fresh_instance = store.get_task_instance(&fresh).unwrap().unwrap();
        assert_eq!(fresh_instance.sandbox_directory.as_deref(), Some("/new/fresh"));
        let recorded_instance = store.get_task_instance(&recorded).unwrap().unwrap();
        assert_eq!(recorded_instance.sandbox_directory.as_deref(), Some("/old"));
        assert!(!store.exists(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_write_is_a_no_op() {
        let (_dir, store) = open_store();
        let task_id = random_task_id();
        store
            .upsert_task_instance(&mock_task_instance(&task_id, None))
            .unwrap();
        assert!(!store.has_sandbox(&task_id).await.unwrap());

        let batch = [(task_id.clone(), "/sandbox".to_string())];
        let first = store.write_sandboxes(&batch).await.unwrap();
        let second = store.write_sandboxes(&batch).await.unwrap();

        assert_eq!(first.written.len(), 1);
        assert!(second.written.is_empty());
        assert_eq!(second.already_recorded, 1);
        assert!(store.has_sandbox(&task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("state");
        let task_id = random_task_id();
        {
            let store = RocksDBSandboxStore::open(path.clone()).unwrap();
            store
                .upsert_task_instance(&mock_task_instance(&task_id, None))
                .unwrap();
            store
                .write_sandboxes(&[(task_id.clone(), "/sandbox".to_string())])
                .await
                .unwrap();
        }

        let store = RocksDBSandboxStore::open(path).unwrap();
        assert!(store.has_sandbox(&task_id).await.unwrap());
    }
}
