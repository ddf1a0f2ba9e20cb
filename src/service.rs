//! Execution service - the admission boundary in front of the queue
//!
//! Rejects unsupported languages and malformed configs synchronously so
//! they are never enqueued, records the `pending` status, and answers
//! status queries from the result store.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{ExecutionConfig, ExecutionResult, ExecutionStatus, ResultStore, ResultUpdate, WORKER_ERROR};
use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::runtime::{Runtime, RuntimeRegistry};

/// Maximum accepted source size
pub const MAX_CODE_BYTES: usize = 1024 * 1024;

pub struct ExecutionService {
    queue: Arc<TaskQueue>,
    runtimes: Arc<RuntimeRegistry<dyn Runtime>>,
    store: Arc<dyn ResultStore>,
    defaults: ExecutionConfig,
}

impl ExecutionService {
    pub fn new(
        queue: Arc<TaskQueue>,
        runtimes: Arc<RuntimeRegistry<dyn Runtime>>,
        store: Arc<dyn ResultStore>,
        defaults: ExecutionConfig,
    ) -> Self {
        ExecutionService {
            queue,
            runtimes,
            store,
            defaults,
        }
    }

    /// Validate and enqueue; returns the execution id
    pub async fn submit(&self, code: &str, language: &str, config: Option<ExecutionConfig>) -> Result<Uuid> {
        let language = language.trim().to_lowercase();
        if code.trim().is_empty() {
            return Err(Error::InvalidInput("Code must not be empty".to_string()));
        }
        if code.len() > MAX_CODE_BYTES {
            return Err(Error::InvalidInput(format!(
                "Code is {} bytes; the limit is {}",
                code.len(),
                MAX_CODE_BYTES
            )));
        }
        if !self.runtimes.supports(&language) {
            return Err(Error::UnsupportedLanguage(language));
        }

        let config = config.unwrap_or_else(|| self.defaults.clone());
        config.validate()?;

        // The record must exist before a worker can claim the task
        let execution_id = Uuid::new_v4();
        self.store
            .update_status(execution_id, ExecutionStatus::Pending, None, None, None)
            .await?;

        if let Err(e) = self.queue.submit_as(execution_id, code, &language, config).await {
            let update = ResultUpdate::new("", e.to_string(), -1, 0).with_error_type(WORKER_ERROR);
            if let Err(store_err) = self.store.save_result(execution_id, update).await {
                warn!("Could not record failed submission {}: {}", execution_id, store_err);
            }
            return Err(e);
        }

        info!("Accepted {} execution {}", language, execution_id);
        Ok(execution_id)
    }

    /// Current record of an execution
    pub async fn status(&self, execution_id: Uuid) -> Result<ExecutionResult> {
        self.store
            .get_result(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))
    }

    /// Languages accepted at submission
    pub fn languages(&self) -> Vec<String> {
        self.runtimes.environments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryResultStore;
    use crate::runtime::ProcessRuntime;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn service(dir: &std::path::Path) -> (ExecutionService, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::open(dir, Duration::from_millis(10)).await.unwrap());
        let mut runtimes: RuntimeRegistry<dyn Runtime> = RuntimeRegistry::new();
        runtimes.register(Arc::new(ProcessRuntime::shell()));
        runtimes.register(Arc::new(ProcessRuntime::python()));
        let service = ExecutionService::new(
            queue.clone(),
            Arc::new(runtimes),
            Arc::new(MemoryResultStore::new()),
            ExecutionConfig::default(),
        );
        (service, queue)
    }

    #[tokio::test]
    async fn test_submit_records_pending() {
        let dir = tempdir().unwrap();
        let (service, queue) = service(dir.path()).await;

        let id = service.submit("echo hi", "Bash", None).await.unwrap();

        let status = service.status(id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Pending);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_admission_errors_are_not_enqueued() {
        let dir = tempdir().unwrap();
        let (service, queue) = service(dir.path()).await;

        let err = service.submit("x", "cobol", None).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedLanguage(_)));

        let bad = ExecutionConfig::default().with_timeout_seconds(0);
        let err = service.submit("x", "python", Some(bad)).await.unwrap_err();
        assert!(err.is_client_error());

        let err = service.submit("   ", "python", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    /// Store that notes how many tasks were already queued when each
    /// `pending` record was written
    struct QueueAwareStore {
        inner: MemoryResultStore,
        queue: Arc<TaskQueue>,
        queued_at_pending: parking_lot::Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl ResultStore for QueueAwareStore {
        fn id(&self) -> &str {
            "queue-aware"
        }

        async fn update_status(
            &self,
            id: Uuid,
            status: ExecutionStatus,
            exit_code: Option<i32>,
            duration_ms: Option<u64>,
            error_type: Option<String>,
        ) -> Result<()> {
            if status == ExecutionStatus::Pending {
                let queued = self.queue.pending_count().await?;
                self.queued_at_pending.lock().push(queued);
            }
            self.inner
                .update_status(id, status, exit_code, duration_ms, error_type)
                .await
        }

        async fn save_result(&self, id: Uuid, update: ResultUpdate) -> Result<()> {
            self.inner.save_result(id, update).await
        }

        async fn get_result(&self, id: Uuid) -> Result<Option<ExecutionResult>> {
            self.inner.get_result(id).await
        }
    }

    #[tokio::test]
    async fn test_pending_is_recorded_before_task_is_claimable() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(TaskQueue::open(dir.path(), Duration::from_millis(10)).await.unwrap());
        let store = Arc::new(QueueAwareStore {
            inner: MemoryResultStore::new(),
            queue: queue.clone(),
            queued_at_pending: parking_lot::Mutex::new(Vec::new()),
        });
        let mut runtimes: RuntimeRegistry<dyn Runtime> = RuntimeRegistry::new();
        runtimes.register(Arc::new(ProcessRuntime::shell()));
        let service = ExecutionService::new(
            queue.clone(),
            Arc::new(runtimes),
            store.clone(),
            ExecutionConfig::default(),
        );

        let first = service.submit("echo a", "bash", None).await.unwrap();
        let second = service.submit("echo b", "bash", None).await.unwrap();

        assert_eq!(*store.queued_at_pending.lock(), vec![0, 1]);
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let claimed = queue
            .claim(Duration::ZERO, &tokio_util::sync::CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.execution_id, first);
        assert_eq!(service.status(second).await.unwrap().status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_status() {
        let dir = tempdir().unwrap();
        let (service, _) = service(dir.path()).await;

        let err = service.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(service.languages().contains(&"python".to_string()));
    }
}
