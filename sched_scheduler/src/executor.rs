//! ABOUTME: Drives one logical execution of a job, including retries (§4.5)
//! ABOUTME: Retry/backoff/timeout loop, lock-guarded, producing one terminal JobRun per attempt

use crate::handler::{Callbacks, JobContext, JobHandler};
use crate::lock::{LockManager, DEFAULT_EXTENSION_INTERVAL, DEFAULT_TTL};
use crate::metrics::MetricsSink;
use chrono::Utc;
use sched_core::{Error, Result};
use sched_storage::{Job, JobRun, RunStatus, Storage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs `job.options.retries + 1` attempts at most, recording one JobRun
/// per attempt, bounded by the Lock Manager's mutual exclusion.
pub struct Executor {
    storage: Arc<dyn Storage>,
    worker_id: String,
    metrics: Arc<dyn MetricsSink>,
}

impl Executor {
    pub fn new(storage: Arc<dyn Storage>, worker_id: impl Into<String>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            storage,
            worker_id: worker_id.into(),
            metrics,
        }
    }

    /// Execute `job` to a terminal `JobRun`, per the algorithm in §4.5.
    /// Returns `Err(JobExecutionError)` only once retries are exhausted and
    /// the caller is `runJob` (scheduled firings log and swallow this —
    /// see `Scheduler`).
    pub async fn run(&self, job: &Job, handler: Arc<dyn JobHandler>, callbacks: &Callbacks) -> Result<JobRun> {
        if job.is_paused {
            let run = skipped_run(&job.name, "paused");
            self.storage.save_job_run(&run).await?;
            return Ok(run);
        }

        let lock_manager = LockManager::new(self.storage.clone(), &job.name, &self.worker_id);
        let guard = match lock_manager.acquire(DEFAULT_TTL, DEFAULT_EXTENSION_INTERVAL).await? {
            Some(guard) => guard,
            None => {
                let run = skipped_run(&job.name, "already running on another worker");
                self.storage.save_job_run(&run).await?;
                return Ok(run);
            }
        };

        self.metrics.record_job_started(&job.name, &self.worker_id);

        let backoff = job.options.resolved_backoff();
        let max_attempts = job.options.retries + 1;
        let mut run = JobRun::new_pending(job.name.clone(), 1);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=max_attempts {
            run.status = RunStatus::Running;
            run.start_time = Some(Utc::now());
            self.storage.save_job_run(&run).await?;

            let context = JobContext::new(run.id.clone(), job.name.clone(), attempt);
            let outcome = self.invoke_with_timeout(handler.clone(), context, job.options.timeout_ms).await;

            match outcome {
                Ok(value) => {
                    run.status = RunStatus::Completed;
                    run.end_time = Some(Utc::now());
                    run.result = Some(value.clone());
                    self.storage.save_job_run(&run).await?;

                    callbacks.fire_success(&value);
                    let duration = duration_seconds(&run);
                    self.metrics.record_job_completed(&job.name, &self.worker_id, duration);

                    info!(job_name = %job.name, attempt, "job attempt completed");
                    self.release(guard).await;
                    return Ok(run);
                }
                Err(err) => {
                    run.status = RunStatus::Failed;
                    run.end_time = Some(Utc::now());
                    run.error = Some(err.to_string());
                    self.storage.save_job_run(&run).await?;

                    callbacks.fire_error(&err);
                    let duration = duration_seconds(&run);
                    self.metrics.record_job_failed(&job.name, &self.worker_id, duration, error_kind(&err));

                    warn!(job_name = %job.name, attempt, error = %err, "job attempt failed");
                    last_error = Some(err);

                    if attempt == max_attempts {
                        break;
                    }

                    let delay = backoff.delay_for_attempt(attempt);
                    tokio::time::sleep(delay).await;
                    run = JobRun::new_pending(job.name.clone(), attempt + 1);
                }
            }
        }

        self.release(guard).await;
        Err(Error::JobExecutionError(
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "exhausted retries".to_string()),
        ))
    }

    async fn release(&self, guard: crate::lock::LockGuard) {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release execution lock");
        }
    }

    /// Race the handler against `timeout_ms`, if set. On expiry the attempt
    /// is recorded as failed with a timeout error, but the handler task
    /// keeps running in the background to its natural conclusion — this
    /// executor does not promise kill-on-timeout semantics (§4.5, §9).
    async fn invoke_with_timeout(
        &self,
        handler: Arc<dyn JobHandler>,
        context: JobContext,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        let Some(timeout_ms) = timeout_ms else {
            return handler.execute(context).await;
        };

        let token = context.cancellation_token.clone();
        let task = tokio::spawn(async move { handler.execute(context).await });

        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::JobExecutionError(format!("handler panicked: {}", join_err))),
            Err(_) => {
                token.cancel();
                Err(Error::JobExecutionError(format!("timed out after {} ms", timeout_ms)))
            }
        }
    }
}

fn skipped_run(job_name: &str, reason: &str) -> JobRun {
    let mut run = JobRun::new_pending(job_name.to_string(), 1);
    run.status = RunStatus::Completed;
    run.start_time = Some(Utc::now());
    run.end_time = run.start_time;
    run.result = Some(json!({ "skipped": true, "reason": reason }));
    run
}

fn duration_seconds(run: &JobRun) -> f64 {
    match (run.start_time, run.end_time) {
        (Some(s), Some(e)) => (e - s).num_milliseconds() as f64 / 1000.0,
        _ => 0.0,
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::InvalidConfiguration(_) => "invalid_configuration",
        Error::InvalidScheduleError(_) => "invalid_schedule",
        Error::StorageUnavailable(_) => "storage_unavailable",
        Error::StorageError(_) => "storage_error",
        Error::JobExecutionError(_) => "job_execution_error",
        Error::JobNotFound(_) => "job_not_found",
        Error::UnsupportedStorage(_) => "unsupported_storage",
        Error::Cancelled(_) => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use sched_storage::memory::MemoryStorage;
    use sched_storage::{Job, JobOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysSucceeds;
    #[async_trait::async_trait]
    impl JobHandler for AlwaysSucceeds {
        async fn execute(&self, _context: JobContext) -> Result<serde_json::Value> {
            Ok(json!({"ok": true}))
        }
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl JobHandler for AlwaysFails {
        async fn execute(&self, _context: JobContext) -> Result<serde_json::Value> {
            Err(Error::JobExecutionError("boom".to_string()))
        }
    }

    struct CountingHandler(Arc<AtomicU32>);
    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn execute(&self, context: JobContext) -> Result<serde_json::Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "attempt": context.attempt }))
        }
    }

    fn executor(storage: Arc<dyn Storage>) -> Executor {
        Executor::new(storage, "w1", Arc::new(NoopMetricsSink))
    }

    #[tokio::test]
    async fn successful_attempt_produces_one_completed_run() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        let ex = executor(storage.clone());

        let run = ex.run(&job, Arc::new(AlwaysSucceeds), &Callbacks::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.attempt, 1);

        let runs = storage.get_job_runs("j", None).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_produce_one_run_per_attempt_and_raise() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        job.options.retries = 2;
        job.options.backoff = sched_core::BackoffKind::Fixed;
        let ex = executor(storage.clone());

        let err = ex.run(&job, Arc::new(AlwaysFails), &Callbacks::default()).await.unwrap_err();
        assert!(matches!(err, Error::JobExecutionError(_)));

        let runs = storage.get_job_runs("j", None).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
        let mut attempts: Vec<u32> = runs.iter().map(|r| r.attempt).collect();
        attempts.sort();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhausted_retries_with_exponential_backoff_space_attempts_out() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        job.options.retries = 2;
        job.options.backoff = sched_core::BackoffKind::Exponential;
        let ex = executor(storage.clone());

        let err = ex.run(&job, Arc::new(AlwaysFails), &Callbacks::default()).await.unwrap_err();
        assert!(matches!(err, Error::JobExecutionError(_)));

        let runs = storage.get_job_runs("j", None).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));

        let mut by_attempt: Vec<&JobRun> = runs.iter().collect();
        by_attempt.sort_by_key(|r| r.attempt);
        assert_eq!(
            by_attempt.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // base_ms=1000, factor=2.0 (sched_core::backoff::Backoff::exponential
        // defaults): the gap before attempt 2 is ~1000ms, before attempt 3 ~2000ms.
        let gap_1_to_2 = by_attempt[1].start_time.unwrap() - by_attempt[0].start_time.unwrap();
        let gap_2_to_3 = by_attempt[2].start_time.unwrap() - by_attempt[1].start_time.unwrap();

        assert!(
            gap_1_to_2.num_milliseconds() >= 900 && gap_1_to_2.num_milliseconds() < 1900,
            "expected ~1000ms gap before attempt 2, got {}ms",
            gap_1_to_2.num_milliseconds()
        );
        assert!(
            gap_2_to_3.num_milliseconds() >= 1900,
            "expected ~2000ms gap before attempt 3, got {}ms",
            gap_2_to_3.num_milliseconds()
        );
    }

    #[tokio::test]
    async fn paused_job_is_skipped_without_invoking_handler() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        job.is_paused = true;
        let ex = executor(storage.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let run = ex.run(&job, Arc::new(CountingHandler(counter.clone())), &Callbacks::default()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(run.result.unwrap()["reason"], "paused");
    }

    #[tokio::test]
    async fn lock_contention_skips_second_worker() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let job = Job::new("shared".into(), "*/5 * * * * *".into(), JobOptions::default());

        storage.acquire_lock("shared", "other-worker", Duration::from_secs(60)).await.unwrap();

        let ex = executor(storage.clone());
        let run = ex.run(&job, Arc::new(AlwaysSucceeds), &Callbacks::default()).await.unwrap();
        assert_eq!(run.result.unwrap()["reason"], "already running on another worker");
    }

    #[tokio::test]
    async fn retries_zero_produces_at_most_one_run() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        let ex = executor(storage.clone());

        let _ = ex.run(&job, Arc::new(AlwaysFails), &Callbacks::default()).await;
        let runs = storage.get_job_runs("j", None).await.unwrap();
        assert_eq!(runs.len(), 1);
    }
}
