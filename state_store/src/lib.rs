//! Durable side of sandbox syncing.
//!
//! The scheduler owns the task instance records. The syncer only fills in the
//! sandbox directory of instances that exist and have none recorded yet, one
//! transaction per batch.

use async_trait::async_trait;
use data_model::TaskId;

pub mod in_memory;
pub mod rocksdb;
pub mod serializer;

pub use self::in_memory::InMemorySandboxStore;
pub use self::rocksdb::RocksDBSandboxStore;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to create state store directory. error: {}", source)]
    CreateDirFailed { source: std::io::Error },

    #[error("Failed to open RocksDB database. error: {}", source)]
    OpenDatabaseFailed { source: ::rocksdb::Error },

    #[error("Column family {} is missing from the database", name)]
    MissingColumnFamily { name: String },

    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("Sandbox write rejected: {}", reason)]
    WriteRejected { reason: String },

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: ::rocksdb::Error,
    },
}

/// What happened to each pair of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Instances whose sandbox directory was written by this batch.
    pub written: Vec<TaskId>,
    /// Instances that already had a sandbox directory; left untouched.
    pub already_recorded: usize,
    /// Ids with no instance record yet.
    pub missing: usize,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.written.len() + self.already_recorded + self.missing
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait SandboxStore: Send + Sync {
    async fn exists(&self, task_id: &TaskId) -> Result<bool, Error>;

    async fn has_sandbox(&self, task_id: &TaskId) -> Result<bool, Error>;

    /// Writes each directory only if its instance exists and has no sandbox
    /// directory. Either the whole batch commits or nothing does.
    async fn write_sandboxes(&self, batch: &[(TaskId, String)]) -> Result<BatchOutcome, Error>;
}
