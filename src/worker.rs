//! Worker pool - drains the task queue into runtimes
//!
//! One claim loop per pool. Each claimed task becomes its own unit of work
//! in a `JoinSet`, gated by a semaphore so at most `max_concurrency`
//! executions run at once. A permit is taken before claiming, so tasks are
//! never pulled off the queue without capacity to run them.
//!
//! A unit retries the whole attempt (status update, runtime selection,
//! execution, result write) with exponential backoff. Once retries are
//! exhausted it stores a terminal `worker_error` result and completes the
//! task, so nothing is silently lost.
//!
//! While a unit holds a task it renews the claim stamp every quarter of
//! `queue.stale_after`, so the reaper only takes back tasks whose worker
//! has stopped.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, WorkerConfig};
use crate::core::{ExecutionStatus, ResultStore, ResultUpdate, RunOutput, TIMEOUT_ERROR, WORKER_ERROR};
use crate::error::{Error, Result};
use crate::queue::{Task, TaskQueue};
use crate::runtime::{Runtime, RuntimeRegistry};

/// Longest single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Shortest interval between claim renewals
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// How one unit of work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Execution finished and its result was stored (any exit code)
    Succeeded,
    /// Retries exhausted; a `worker_error` result was stored
    Failed,
    /// Shutdown interrupted the unit; the task went back to pending
    Released,
}

/// Counters collected over one `WorkerPool::run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Units released, aborted or panicked; their tasks are back in (or will
    /// be reclaimed into) pending
    pub abandoned: usize,
    pub reclaimed: usize,
}

impl WorkerReport {
    fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Succeeded => self.succeeded += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Released => self.abandoned += 1,
        }
    }
}

/// Bounded-concurrency consumer of a `TaskQueue`
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    runtimes: Arc<RuntimeRegistry<dyn Runtime>>,
    store: Arc<dyn ResultStore>,
    config: WorkerConfig,
    claim_timeout: Duration,
    stale_after: Duration,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        runtimes: Arc<RuntimeRegistry<dyn Runtime>>,
        store: Arc<dyn ResultStore>,
        config: &Config,
    ) -> Self {
        let max_concurrency = config.worker.max_concurrency.max(1);
        WorkerPool {
            queue,
            runtimes,
            store,
            config: config.worker.clone(),
            claim_timeout: config.queue.claim_timeout,
            stale_after: config.queue.stale_after,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Permits not currently held by running units
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Claim and execute tasks until `cancel` fires, then drain in-flight
    /// units for up to `shutdown_grace`.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerReport {
        info!(
            "Worker pool started (concurrency {}, retries {})",
            self.config.max_concurrency, self.config.max_retries
        );

        let mut report = WorkerReport::default();
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        // Units remove their own id when they return; aborted ones never do
        let in_flight: Arc<DashSet<Uuid>> = Arc::new(DashSet::new());

        report.reclaimed += self.reclaim().await;
        let mut last_reclaim = Instant::now();

        loop {
            while let Some(joined) = units.try_join_next() {
                settle(joined, &mut report);
            }

            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                report.reclaimed += self.reclaim().await;
                last_reclaim = Instant::now();
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // claim() only observes cancellation between polls, never mid-rename
            let task = match self.queue.claim(self.claim_timeout, &cancel).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    error!("Claim failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.claim_timeout.min(Duration::from_secs(1))) => continue,
                    }
                }
            };

            report.claimed += 1;
            let execution_id = task.execution_id;
            let pool = self.clone();
            let unit_cancel = cancel.clone();
            let unit_in_flight = in_flight.clone();
            in_flight.insert(execution_id);
            units.spawn(async move {
                let _permit = permit;
                let outcome = pool.process(task, unit_cancel).await;
                unit_in_flight.remove(&execution_id);
                outcome
            });
        }

        info!("Worker pool stopping; {} units in flight", units.len());

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = units.join_next().await {
                settle(joined, &mut report);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown grace elapsed; aborting {} units",
                units.len()
            );
            units.abort_all();
            while let Some(joined) = units.join_next().await {
                settle(joined, &mut report);
            }
        }

        // Anything aborted or panicked is still claimed; hand it back now
        let stranded: Vec<Uuid> = in_flight.iter().map(|id| *id).collect();
        for execution_id in stranded {
            self.release(execution_id).await;
        }

        info!(
            "Worker pool stopped: claimed {}, succeeded {}, failed {}, abandoned {}",
            report.claimed, report.succeeded, report.failed, report.abandoned
        );
        report
    }

    async fn reclaim(&self) -> usize {
        match self.queue.reclaim_stale(self.stale_after).await {
            Ok(0) => 0,
            Ok(n) => {
                warn!("Reclaimed {} stale tasks", n);
                n
            }
            Err(e) => {
                error!("Stale task reclaim failed: {}", e);
                0
            }
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_base * 2)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(MAX_BACKOFF)
            .with_max_elapsed_time(None)
            .build()
    }

    /// One unit of work: attempt, retry with backoff, then give up
    #[instrument(skip_all, fields(execution_id = %task.execution_id))]
    async fn process(&self, task: Task, cancel: CancellationToken) -> UnitOutcome {
        let heartbeat = self.heartbeat(task.execution_id);
        let verdict = self.run_attempts(&task, &cancel).await;
        // No renewal may rename the entry once complete/release looks for it
        heartbeat.stop().await;

        match verdict {
            Verdict::Done => {
                self.complete(task.execution_id).await;
                UnitOutcome::Succeeded
            }
            Verdict::GaveUp(err) => self.give_up(&task, &err).await,
            Verdict::Interrupted => {
                self.release(task.execution_id).await;
                UnitOutcome::Released
            }
        }
    }

    async fn run_attempts(&self, task: &Task, cancel: &CancellationToken) -> Verdict {
        let mut backoff = self.backoff();
        let mut retries = 0;

        loop {
            let err = match self.attempt(task).await {
                Ok(()) => return Verdict::Done,
                Err(e) => e,
            };

            if err.is_client_error() || retries >= self.config.max_retries {
                error!("Execution failed after {} retries: {}", retries, err);
                return Verdict::GaveUp(err);
            }

            retries += 1;
            let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
            warn!("Attempt {} failed: {}; retrying in {:?}", retries, err, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Verdict::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Renew the claim on `execution_id` until the returned handle is
    /// stopped or dropped
    fn heartbeat(&self, execution_id: Uuid) -> Heartbeat {
        let stop = CancellationToken::new();
        let every = (self.stale_after / 4).max(MIN_HEARTBEAT);
        let queue = self.queue.clone();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match queue.touch(execution_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Claim on {} was lost while running", execution_id);
                        break;
                    }
                    Err(e) => warn!("Claim renewal for {} failed: {}", execution_id, e),
                }
            }
        });

        Heartbeat {
            _guard: stop.drop_guard(),
            handle,
        }
    }

    /// Mark running, pick a runtime, execute under the wrapper timeout, store
    async fn attempt(&self, task: &Task) -> Result<()> {
        let id = task.execution_id;
        self.store
            .update_status(id, ExecutionStatus::Running, None, None, None)
            .await?;

        let runtime = self
            .runtimes
            .select_best(&task.language, self.config.runtime_preference)
            .await
            .ok_or_else(|| {
                if self.runtimes.supports(&task.language) {
                    Error::NoRuntimeAvailable(task.language.clone())
                } else {
                    Error::UnsupportedLanguage(task.language.clone())
                }
            })?;

        debug!("Running on '{}'", runtime.name());

        // Image pulls and similar set-up do not count against the execution
        match tokio::time::timeout(self.config.prepare_timeout, runtime.prepare(&task.language)).await {
            Ok(prepared) => prepared?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Preparing '{}' for {} took longer than {:?}",
                    runtime.name(),
                    task.language,
                    self.config.prepare_timeout
                )))
            }
        }

        let wall = task.config.timeout() + self.config.timeout_grace;
        let output = match tokio::time::timeout(
            wall,
            runtime.execute(&task.language, &task.code, &task.config),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!("Runtime '{}' exceeded the {:?} wrapper timeout", runtime.name(), wall);
                RunOutput::timed_out(String::new(), format!("Execution exceeded {:?}", wall), wall)
            }
        };

        self.store.save_result(id, to_update(output)).await?;
        Ok(())
    }

    async fn give_up(&self, task: &Task, err: &Error) -> UnitOutcome {
        let update = ResultUpdate::new("", err.to_string(), -1, 0).with_error_type(WORKER_ERROR);

        match self.store.save_result(task.execution_id, update).await {
            Ok(()) => self.complete(task.execution_id).await,
            // Without a stored result the task stays claimed for the reaper
            Err(e) => error!("Could not store the failure result: {}", e),
        }
        UnitOutcome::Failed
    }

    async fn complete(&self, execution_id: Uuid) {
        if let Err(e) = self.queue.complete(execution_id).await {
            error!("Failed to complete task {}: {}", execution_id, e);
        }
    }

    async fn release(&self, execution_id: Uuid) {
        if let Err(e) = self.queue.release(execution_id).await {
            error!("Failed to release task {}: {}", execution_id, e);
            return;
        }
        if let Err(e) = self
            .store
            .update_status(execution_id, ExecutionStatus::Pending, None, None, None)
            .await
        {
            warn!("Failed to reset status of {}: {}", execution_id, e);
        }
    }
}

/// Where a unit's attempts left the task
enum Verdict {
    Done,
    GaveUp(Error),
    Interrupted,
}

/// Claim renewal task; dropping it (e.g. when the unit is aborted) stops
/// the renewals too
struct Heartbeat {
    _guard: DropGuard,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        let Heartbeat { _guard: guard, handle } = self;
        drop(guard);
        if let Err(e) = handle.await {
            debug!("Heartbeat ended abnormally: {}", e);
        }
    }
}

fn settle(joined: std::result::Result<UnitOutcome, JoinError>, report: &mut WorkerReport) {
    match joined {
        Ok(outcome) => report.record(outcome),
        Err(e) => {
            if e.is_panic() {
                error!("Worker unit panicked: {}", e);
            } else {
                debug!("Worker unit aborted");
            }
            report.abandoned += 1;
        }
    }
}

fn to_update(output: RunOutput) -> ResultUpdate {
    let duration_ms = output.duration_ms();
    let update = ResultUpdate::new(output.stdout, output.stderr, output.exit_code, duration_ms);
    match (output.timed_out, output.error_type) {
        (true, error_type) => update.timed_out(error_type.unwrap_or_else(|| TIMEOUT_ERROR.to_string())),
        (false, Some(error_type)) => update.with_error_type(error_type),
        (false, None) => update,
    }
}
