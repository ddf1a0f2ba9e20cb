//! Storage traits - Result persistence for executions
//!
//! The worker pool and the service façade only talk to results through
//! `ResultStore`. Two backends ship with the crate:
//! - `FileResultStore`: one JSON document per execution id on local disk
//! - `MemoryResultStore`: process-local map, for tests and embedding

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::types::{ExecutionResult, ExecutionStatus};
use crate::error::{Error, Result};

/// Final output of an execution handed to `ResultStore::save_result`
#[derive(Debug, Clone, Default)]
pub struct ResultUpdate {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timeout: bool,
    pub error_type: Option<String>,
}

impl ResultUpdate {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32, duration_ms: u64) -> Self {
        ResultUpdate {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration_ms,
            timeout: false,
            error_type: None,
        }
    }

    /// Mark the execution as timed out
    pub fn timed_out(mut self, error_type: impl Into<String>) -> Self {
        self.timeout = true;
        self.error_type = Some(error_type.into());
        self
    }

    /// Attach an error classification
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Status implied by this output
    pub fn status(&self) -> ExecutionStatus {
        if self.exit_code == 0 && !self.timeout {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Abstract interface for execution result persistence
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Get the backend ID
    fn id(&self) -> &str;

    /// Record a status transition, creating the record if needed
    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
        error_type: Option<String>,
    ) -> Result<()>;

    /// Record the terminal output of an execution
    async fn save_result(&self, id: Uuid, update: ResultUpdate) -> Result<()>;

    /// Retrieve a record
    async fn get_result(&self, id: Uuid) -> Result<Option<ExecutionResult>>;
}

fn apply_status(
    record: &mut ExecutionResult,
    status: ExecutionStatus,
    exit_code: Option<i32>,
    duration_ms: Option<u64>,
    error_type: Option<String>,
) {
    // A recorded exit code is final; late or repeated transitions are dropped
    if record.is_terminal() && !status.is_terminal() {
        debug!(
            "Ignoring {} for finished execution {} ({})",
            status, record.execution_id, record.status
        );
        return;
    }
    record.status = status;
    if exit_code.is_some() {
        record.exit_code = exit_code;
    }
    if duration_ms.is_some() {
        record.duration_ms = duration_ms;
    }
    if error_type.is_some() {
        record.error_type = error_type;
    }
    if status.is_terminal() {
        record.completed_at = Some(Utc::now());
    }
}

fn apply_result(record: &mut ExecutionResult, update: ResultUpdate) {
    record.status = update.status();
    record.exit_code = Some(update.exit_code);
    record.stdout = Some(update.stdout);
    record.stderr = Some(update.stderr);
    record.duration_ms = Some(update.duration_ms);
    record.timeout = update.timeout;
    record.error_type = update.error_type;
    record.completed_at = Some(Utc::now());
}

/// File-backed result store: `<dir>/<execution-id>.json`
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    /// Create the store, making sure the directory exists
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Storage(format!("Failed to create results dir {}: {}", dir.display(), e))
        })?;
        Ok(FileResultStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(&self, id: Uuid) -> Result<Option<ExecutionResult>> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &ExecutionResult) -> Result<()> {
        let path = self.path_for(record.execution_id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.execution_id, Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Stored result {} ({})", record.execution_id, record.status);
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    fn id(&self) -> &str {
        "file"
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
        error_type: Option<String>,
    ) -> Result<()> {
        let mut record = self
            .read(id)
            .await?
            .unwrap_or_else(|| ExecutionResult::new(id, status));
        apply_status(&mut record, status, exit_code, duration_ms, error_type);
        self.write(&record).await
    }

    async fn save_result(&self, id: Uuid, update: ResultUpdate) -> Result<()> {
        let mut record = self
            .read(id)
            .await?
            .unwrap_or_else(|| ExecutionResult::new(id, ExecutionStatus::Running));
        apply_result(&mut record, update);
        self.write(&record).await
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ExecutionResult>> {
        self.read(id).await
    }
}

/// In-memory result store
#[derive(Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<Uuid, ExecutionResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    fn id(&self) -> &str {
        "memory"
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
        error_type: Option<String>,
    ) -> Result<()> {
        let mut results = self.results.write().await;
        let record = results
            .entry(id)
            .or_insert_with(|| ExecutionResult::new(id, status));
        apply_status(record, status, exit_code, duration_ms, error_type);
        Ok(())
    }

    async fn save_result(&self, id: Uuid, update: ResultUpdate) -> Result<()> {
        let mut results = self.results.write().await;
        let record = results
            .entry(id)
            .or_insert_with(|| ExecutionResult::new(id, ExecutionStatus::Running));
        apply_result(record, update);
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ExecutionResult>> {
        Ok(self.results.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TIMEOUT_ERROR;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_result_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileResultStore::new(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        store
            .save_result(id, ResultUpdate::new("out", "err", 0, 500))
            .await
            .unwrap();

        let result = store.get_result(id).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.as_deref(), Some("out"));
        assert_eq!(result.stderr.as_deref(), Some("err"));
        assert_eq!(result.duration_ms, Some(500));
        assert!(result.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed() {
        let store = MemoryResultStore::new();
        let id = Uuid::new_v4();

        store
            .save_result(id, ResultUpdate::new("", "SyntaxError", 1, 100))
            .await
            .unwrap();

        let result = store.get_result(id).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_timeout_flag() {
        let dir = tempdir().unwrap();
        let store = FileResultStore::new(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        store
            .save_result(
                id,
                ResultUpdate::new("partial", "", 124, 5000).timed_out(TIMEOUT_ERROR),
            )
            .await
            .unwrap();

        let result = store.get_result(id).await.unwrap().unwrap();
        assert!(result.timeout);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_type.as_deref(), Some(TIMEOUT_ERROR));
    }

    #[tokio::test]
    async fn test_status_transitions_keep_created_at() {
        let dir = tempdir().unwrap();
        let store = FileResultStore::new(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        store
            .update_status(id, ExecutionStatus::Running, None, None, None)
            .await
            .unwrap();
        let running = store.get_result(id).await.unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(!running.is_terminal());

        store
            .save_result(id, ResultUpdate::new("ok", "", 0, 10))
            .await
            .unwrap();
        let done = store.get_result(id).await.unwrap().unwrap();
        assert_eq!(done.created_at, running.created_at);
        assert!(done.is_terminal());
    }

    #[tokio::test]
    async fn test_finished_result_is_not_reopened() {
        let dir = tempdir().unwrap();
        let file = FileResultStore::new(dir.path()).await.unwrap();
        let memory = MemoryResultStore::new();
        let stores: [&dyn ResultStore; 2] = [&file, &memory];

        for store in stores {
            let id = Uuid::new_v4();
            store
                .save_result(id, ResultUpdate::new("ok", "", 0, 10))
                .await
                .unwrap();

            for late in [ExecutionStatus::Pending, ExecutionStatus::Running] {
                store.update_status(id, late, None, None, None).await.unwrap();
            }

            let result = store.get_result(id).await.unwrap().unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed, "{} store", store.id());
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(result.stdout.as_deref(), Some("ok"));
        }
    }

    #[tokio::test]
    async fn test_missing_result() {
        let store = MemoryResultStore::new();
        assert!(store.get_result(Uuid::new_v4()).await.unwrap().is_none());
    }
}
