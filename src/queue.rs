//! Durable filesystem task queue
//!
//! Layout under the queue root:
//! - `tmp/`: payloads being written
//! - `pending/`: submitted tasks, named `<yyyyMMdd_HHmmss_ffffff>_<uuid>.json`
//! - `processing/`: claimed tasks, named `<pending-stem>@<claim-micros>.json`
//! - `failed/`: payloads that could not be decoded
//!
//! A claim is a rename from `pending/` into `processing/`. Rename is atomic
//! on a single filesystem, so exactly one claimant wins; the losers see
//! `NotFound` and move on to the next candidate. No locks are held anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::core::ExecutionConfig;
use crate::error::{Error, Result};

const PENDING: &str = "pending";
const PROCESSING: &str = "processing";
const TMP: &str = "tmp";
const FAILED: &str = "failed";

/// A submitted execution request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub execution_id: Uuid,
    pub code: String,
    pub language: String,
    pub config: ExecutionConfig,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
}

/// Filesystem-backed FIFO queue with multi-consumer claim
pub struct TaskQueue {
    root: PathBuf,
    poll_interval: Duration,
    /// Last issued timestamp in microseconds; keeps file names strictly increasing
    last_stamp: AtomicI64,
}

impl TaskQueue {
    /// Open (and create if needed) a queue rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let root = dir.into();
        for area in [PENDING, PROCESSING, TMP, FAILED] {
            tokio::fs::create_dir_all(root.join(area)).await.map_err(|e| {
                Error::Queue(format!("Failed to create {}/{}: {}", root.display(), area, e))
            })?;
        }

        debug!("Opened task queue at {}", root.display());
        Ok(TaskQueue {
            root,
            poll_interval,
            last_stamp: AtomicI64::new(0),
        })
    }

    /// Open the queue described by configuration
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        Self::open(&config.dir, config.poll_interval).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn area(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Strictly increasing creation timestamp for this queue handle
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_stamp
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Submit a task; returns its execution id.
    ///
    /// The payload is written and synced under `tmp/`, then renamed into
    /// `pending/` so consumers never observe a partial file.
    pub async fn submit(&self, code: &str, language: &str, config: ExecutionConfig) -> Result<Uuid> {
        let execution_id = Uuid::new_v4();
        self.submit_as(execution_id, code, language, config).await?;
        Ok(execution_id)
    }

    /// Submit under an id chosen by the caller, so records keyed by it can
    /// exist before any consumer can claim the task.
    pub async fn submit_as(
        &self,
        execution_id: Uuid,
        code: &str,
        language: &str,
        config: ExecutionConfig,
    ) -> Result<()> {
        if language.trim().is_empty() {
            return Err(Error::InvalidInput("language must not be empty".into()));
        }
        config.validate()?;

        let created_at = self.next_stamp();
        let file_name = format!("{}_{}.json", created_at.format("%Y%m%d_%H%M%S_%6f"), execution_id);

        let task = Task {
            execution_id,
            code: code.to_string(),
            language: language.to_lowercase(),
            config,
            created_at,
            file_name: file_name.clone(),
        };

        let tmp_path = self.area(TMP).join(&file_name);
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&serde_json::to_vec(&task)?).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, self.area(PENDING).join(&file_name)).await?;

        info!("Submitted task {} ({})", execution_id, task.language);
        Ok(())
    }

    /// Claim the oldest pending task, polling until `wait` elapses.
    ///
    /// Returns `None` on timeout or cancellation.
    pub async fn claim(&self, wait: Duration, cancel: &CancellationToken) -> Result<Option<Task>> {
        let deadline = Instant::now() + wait;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// One pass over the pending area in filename order
    pub async fn try_claim(&self) -> Result<Option<Task>> {
        for name in list_entries(&self.area(PENDING)).await? {
            let stem = name.trim_end_matches(".json");
            let claimed_name = format!("{}@{}.json", stem, Utc::now().timestamp_micros());
            let from = self.area(PENDING).join(&name);
            let to = self.area(PROCESSING).join(&claimed_name);

            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Lost claim race for {}", name);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let bytes = tokio::fs::read(&to).await?;
            match serde_json::from_slice::<Task>(&bytes) {
                Ok(task) => {
                    debug!("Claimed task {}", task.execution_id);
                    return Ok(Some(task));
                }
                Err(e) => {
                    warn!("Moving undecodable task {} to failed/: {}", name, e);
                    tokio::fs::rename(&to, self.area(FAILED).join(&name)).await?;
                }
            }
        }

        Ok(None)
    }

    /// Remove the processing entry for an execution.
    ///
    /// Returns whether an entry was removed; a missing entry is not an error.
    pub async fn complete(&self, execution_id: Uuid) -> Result<bool> {
        let id = execution_id.to_string();
        let mut removed = false;

        for name in list_entries(&self.area(PROCESSING)).await? {
            if !name.contains(&id) {
                continue;
            }
            match tokio::fs::remove_file(self.area(PROCESSING).join(&name)).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed {
            debug!("Completed task {}", execution_id);
        }
        Ok(removed)
    }

    /// Move processing entries claimed more than `older_than` ago back to
    /// pending, under their original name. Returns how many were moved.
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_micros() - older_than.as_micros() as i64;
        let mut reclaimed = 0;

        for name in list_entries(&self.area(PROCESSING)).await? {
            let Some((_, claimed_at)) = split_claimed_name(&name) else {
                continue;
            };
            if claimed_at > cutoff {
                continue;
            }
            if self.move_back(&name).await? {
                warn!("Reclaimed stale task {}", name);
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    /// Renew the claim stamp of a task that is still being worked on, so
    /// `reclaim_stale` measures time since the last sign of life.
    ///
    /// Returns false when the task is no longer claimed.
    pub async fn touch(&self, execution_id: Uuid) -> Result<bool> {
        let id = execution_id.to_string();

        for name in list_entries(&self.area(PROCESSING)).await? {
            if !name.contains(&id) {
                continue;
            }
            let Some((stem, _)) = split_claimed_name(&name) else {
                continue;
            };
            let renewed = format!("{}@{}.json", stem, Utc::now().timestamp_micros());

            match tokio::fs::rename(
                self.area(PROCESSING).join(&name),
                self.area(PROCESSING).join(&renewed),
            )
            .await
            {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(false)
    }

    /// Give a claimed task back to pending right away (e.g. on shutdown).
    ///
    /// It keeps its original name, and with it its place in the FIFO order.
    pub async fn release(&self, execution_id: Uuid) -> Result<bool> {
        let id = execution_id.to_string();
        let mut released = false;

        for name in list_entries(&self.area(PROCESSING)).await? {
            if name.contains(&id) && self.move_back(&name).await? {
                released = true;
            }
        }

        if released {
            info!("Released task {} back to pending", execution_id);
        }
        Ok(released)
    }

    async fn move_back(&self, claimed_name: &str) -> Result<bool> {
        let Some((stem, _)) = split_claimed_name(claimed_name) else {
            return Ok(false);
        };

        match tokio::fs::rename(
            self.area(PROCESSING).join(claimed_name),
            self.area(PENDING).join(format!("{}.json", stem)),
        )
        .await
        {
            Ok(()) => Ok(true),
            // Completed or moved by someone else meanwhile
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of tasks waiting to be claimed
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(list_entries(&self.area(PENDING)).await?.len())
    }

    /// Number of claimed, not yet completed tasks
    pub async fn processing_count(&self) -> Result<usize> {
        Ok(list_entries(&self.area(PROCESSING)).await?.len())
    }
}

/// `<stem>@<micros>.json` -> (`<stem>`, micros)
fn split_claimed_name(name: &str) -> Option<(&str, i64)> {
    let base = name.strip_suffix(".json")?;
    let (stem, stamp) = base.rsplit_once('@')?;
    Some((stem, stamp.parse().ok()?))
}

/// Sorted `.json` file names in a directory, hidden files excluded
async fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".json") && !name.starts_with('.') {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn queue(dir: &Path) -> TaskQueue {
        TaskQueue::open(dir, Duration::from_millis(10)).await.unwrap()
    }

    #[tokio::test]
    async fn test_fifo_single_consumer() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let a = queue.submit("print('a')", "python", ExecutionConfig::default()).await.unwrap();
        let b = queue.submit("print('b')", "python", ExecutionConfig::default()).await.unwrap();
        let c = queue.submit("print('c')", "python", ExecutionConfig::default()).await.unwrap();

        let mut order = Vec::new();
        while let Some(task) = queue.claim(Duration::ZERO, &cancel).await.unwrap() {
            order.push(task.execution_id);
        }

        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_once_claim() {
        const TASKS: usize = 60;
        const CLAIMERS: usize = 8;

        let dir = tempdir().unwrap();
        let queue = Arc::new(queue(dir.path()).await);

        let mut submitted = HashSet::new();
        for i in 0..TASKS {
            let id = queue
                .submit(&format!("echo {}", i), "bash", ExecutionConfig::default())
                .await
                .unwrap();
            submitted.insert(id);
        }

        let mut handles = Vec::new();
        for _ in 0..CLAIMERS {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut claimed = Vec::new();
                while let Some(task) = queue.claim(Duration::ZERO, &cancel).await.unwrap() {
                    claimed.push(task.execution_id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<Uuid> = all.iter().copied().collect();
        assert_eq!(all.len(), TASKS, "a task was claimed twice or lost");
        assert_eq!(unique, submitted);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let id = queue.submit("1+1", "python", ExecutionConfig::default()).await.unwrap();
        let task = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(task.execution_id, id);
        assert_eq!(queue.processing_count().await.unwrap(), 1);

        assert!(queue.complete(id).await.unwrap());
        assert!(!queue.complete(id).await.unwrap());
        assert!(!queue.complete(Uuid::new_v4()).await.unwrap());
        assert_eq!(queue.processing_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let task = queue.claim(Duration::from_millis(50), &cancel).await.unwrap();
        assert!(task.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancelled_claim_returns_promptly() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let task = queue.claim(Duration::from_secs(30), &cancel).await.unwrap();
        assert!(task.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_payload_format() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;

        let id = queue.submit("x", "Python", ExecutionConfig::default()).await.unwrap();
        let names = list_entries(&dir.path().join(PENDING)).await.unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(&format!("_{}.json", id)));
        // yyyyMMdd_HHmmss_ffffff_
        assert_eq!(names[0].find(&id.to_string()), Some(23));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(PENDING).join(&names[0])).unwrap())
                .unwrap();
        assert_eq!(raw["executionId"], id.to_string());
        assert_eq!(raw["language"], "python");
        assert_eq!(raw["fileName"], names[0]);
        assert!(raw["config"]["timeoutSeconds"].is_u64());
    }

    #[tokio::test]
    async fn test_admission_rejects_malformed_config() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;

        let bad = ExecutionConfig::default().with_timeout_seconds(0);
        assert!(matches!(
            queue.submit("x", "python", bad).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(queue.submit("x", "  ", ExecutionConfig::default()).await.is_err());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_stale_processing_entries() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let id = queue.submit("x", "python", ExecutionConfig::default()).await.unwrap();
        queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();

        assert_eq!(queue.reclaim_stale(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.reclaim_stale(Duration::from_millis(1)).await.unwrap(), 1);
        assert_eq!(queue.processing_count().await.unwrap(), 0);

        let again = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(again.execution_id, id);
    }

    #[tokio::test]
    async fn test_touch_renews_claim() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let id = queue.submit("x", "python", ExecutionConfig::default()).await.unwrap();
        queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.touch(id).await.unwrap());

        assert_eq!(queue.reclaim_stale(Duration::from_millis(100)).await.unwrap(), 0);
        assert_eq!(queue.processing_count().await.unwrap(), 1);

        assert!(queue.complete(id).await.unwrap());
        assert!(!queue.touch(id).await.unwrap());
        assert!(!queue.touch(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_keeps_fifo_position() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        let first = queue.submit("1", "python", ExecutionConfig::default()).await.unwrap();
        let second = queue.submit("2", "python", ExecutionConfig::default()).await.unwrap();

        let claimed = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(claimed.execution_id, first);
        assert!(queue.release(first).await.unwrap());
        assert!(!queue.release(first).await.unwrap());

        let again = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(again.execution_id, first);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert!(queue.complete(first).await.unwrap());

        let next = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(next.execution_id, second);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_skipped() {
        let dir = tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let cancel = CancellationToken::new();

        std::fs::write(
            dir.path().join(PENDING).join("00000000_000000_000000_broken.json"),
            b"{not json",
        )
        .unwrap();
        let id = queue.submit("x", "python", ExecutionConfig::default()).await.unwrap();

        let task = queue.claim(Duration::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(task.execution_id, id);
        assert_eq!(list_entries(&dir.path().join(FAILED)).await.unwrap().len(), 1);
    }

    #[test]
    fn test_split_claimed_name() {
        assert_eq!(
            split_claimed_name("20240101_000000_000001_abc@1700000000000000.json"),
            Some(("20240101_000000_000001_abc", 1_700_000_000_000_000))
        );
        assert_eq!(split_claimed_name("no-claim-stamp.json"), None);
    }
}
