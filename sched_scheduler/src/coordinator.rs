//! ABOUTME: The facade a registering process interacts with (§4.6)
//! ABOUTME: Lifecycle, registration, manual trigger, pause/resume, statistics aggregation

use crate::executor::Executor;
use crate::handler::{Callbacks, ErrorCallback, JobHandler, SuccessCallback};
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::scheduler::Scheduler;
use sched_core::{BackoffKind, Error, Result};
use sched_storage::{Job, JobOptions, JobRun, JobStats, Storage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Options recognized on `schedule()` (§3). Callbacks are deliberately kept
/// out of the persisted `JobOptions` — they exist only for the duration of
/// this process's registration.
#[derive(Clone)]
pub struct ScheduleOptions {
    pub retries: u32,
    pub backoff: BackoffKind,
    pub timeout_ms: Option<u64>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: BackoffKind::Fixed,
            timeout_ms: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl ScheduleOptions {
    fn persisted(&self) -> JobOptions {
        JobOptions {
            retries: self.retries,
            backoff: self.backoff,
            timeout_ms: self.timeout_ms,
        }
    }

    fn callbacks(&self) -> Callbacks {
        Callbacks {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    callbacks: Callbacks,
}

/// Per-process worker identity used in every lock operation. Opaque to
/// other workers — only lock-ownership matching cares about it (§4.6).
fn default_worker_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let pid = std::process::id();
    let salt: u32 = rand::random();
    format!("{}:{}:{:08x}", hostname, pid, salt)
}

pub struct Coordinator {
    storage: Arc<dyn Storage>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    worker_id: String,
    registry: Arc<RwLock<HashMap<String, Registration>>>,
    running: AtomicBool,
}

impl Coordinator {
    /// Connect to `storage_uri` (§6) and build the facade. Does not start
    /// the Scheduler — call `start()` for that.
    pub async fn connect(storage_uri: &str) -> Result<Self> {
        Self::connect_with(storage_uri, Arc::new(NoopMetricsSink), None).await
    }

    pub async fn connect_with(
        storage_uri: &str,
        metrics: Arc<dyn MetricsSink>,
        worker_id: Option<String>,
    ) -> Result<Self> {
        let storage = sched_storage::connect(storage_uri).await?;
        let worker_id = worker_id.unwrap_or_else(default_worker_id);
        let executor = Arc::new(Executor::new(storage.clone(), worker_id.clone(), metrics));
        let scheduler = Arc::new(Scheduler::new(storage.clone(), executor.clone()));

        Ok(Self {
            storage,
            scheduler,
            executor,
            worker_id,
            registry: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register `name`/`expression` with `handler`, persist the Job, and —
    /// if the Coordinator is running — arm its timer immediately.
    pub async fn schedule(
        &self,
        name: impl Into<String>,
        expression: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: ScheduleOptions,
    ) -> Result<Job> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidConfiguration("job name must be non-empty".to_string()));
        }
        let expression = expression.into();

        let job = Job::new(name.clone(), expression, options.persisted());
        job.validate()?;

        self.registry.write().await.insert(
            name.clone(),
            Registration {
                handler: handler.clone(),
                callbacks: options.callbacks(),
            },
        );

        self.storage.save_job(&job).await?;

        if self.is_running() {
            self.scheduler.arm(job.clone(), handler, options.callbacks()).await;
        }

        Ok(job)
    }

    /// Remove `name` from the Scheduler, drop its handler, and delete it
    /// from Storage.
    pub async fn unschedule(&self, name: &str) -> Result<()> {
        self.scheduler.disarm(name).await;
        self.registry.write().await.remove(name);
        self.storage.delete_job(name).await?;
        Ok(())
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.storage.get_job(name).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.storage.list_jobs().await
    }

    pub async fn pause_job(&self, name: &str) -> Result<bool> {
        self.storage.pause_job(name).await
    }

    pub async fn resume_job(&self, name: &str) -> Result<bool> {
        self.storage.resume_job(name).await
    }

    /// Execute `name` immediately, out-of-band. The Scheduler's timer for
    /// this job, if any, is untouched (§8 scenario 6).
    pub async fn run_job(&self, name: &str) -> Result<JobRun> {
        let job = self
            .storage
            .get_job(name)
            .await?
            .ok_or_else(|| Error::JobNotFound(name.to_string()))?;

        let registry = self.registry.read().await;
        let registration = registry
            .get(name)
            .ok_or_else(|| Error::JobNotFound(format!("no handler registered for {}", name)))?;

        self.executor.run(&job, registration.handler.clone(), &registration.callbacks).await
    }

    pub async fn get_job_runs(&self, name: &str, limit: Option<u32>) -> Result<Vec<JobRun>> {
        self.storage.get_job_runs(name, limit).await
    }

    pub async fn get_job_stats(&self, name: Option<&str>) -> Result<JobStats> {
        self.storage.get_job_stats(name).await
    }

    pub async fn get_stats(&self) -> Result<JobStats> {
        self.storage.get_job_stats(None).await
    }

    pub async fn get_upcoming_runs(&self, name: &str, n: usize) -> Result<Vec<chrono::DateTime<chrono::Utc>>> {
        let job = self
            .storage
            .get_job(name)
            .await?
            .ok_or_else(|| Error::JobNotFound(name.to_string()))?;
        sched_core::clock::upcoming_fires(&job.schedule, sched_core::clock::now(), sched_core::clock::default_zone(), n)
    }

    /// Connect Storage, reload jobs, arm every job with a registered
    /// handler, and warn about orphans (§4.6, §9).
    pub async fn start(&self) -> Result<()> {
        self.storage.connect().await?;

        let jobs = self.storage.list_jobs().await?;
        let registry = self.registry.read().await;

        for job in jobs {
            if !job.is_active {
                continue;
            }
            match registry.get(&job.name) {
                Some(registration) => {
                    self.scheduler
                        .arm(job, registration.handler.clone(), registration.callbacks.clone())
                        .await;
                }
                None => {
                    warn!(job_name = %job.name, "job has no registered handler, not arming");
                }
            }
        }

        self.running.store(true, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "coordinator started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop_all().await;
        self.running.store(false, Ordering::SeqCst);
        self.storage.disconnect().await?;
        info!(worker_id = %self.worker_id, "coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Noop;
    #[async_trait::async_trait]
    impl JobHandler for Noop {
        async fn execute(&self, _context: crate::handler::JobContext) -> Result<serde_json::Value> {
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn schedule_rejects_empty_name() {
        let c = Coordinator::connect("memory://").await.unwrap();
        let err = c
            .schedule("", "*/5 * * * * *", Arc::new(Noop), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn schedule_rejects_bad_cron() {
        let c = Coordinator::connect("memory://").await.unwrap();
        let err = c
            .schedule("j", "not a cron", Arc::new(Noop), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidScheduleError(_)));
    }

    #[tokio::test]
    async fn run_job_without_registered_handler_is_job_not_found() {
        let c = Coordinator::connect("memory://").await.unwrap();
        let job = Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default());
        c.storage.save_job(&job).await.unwrap();

        let err = c.run_job("j").await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn run_job_does_not_disturb_scheduler_next_run() {
        let c = Coordinator::connect("memory://").await.unwrap();
        c.schedule("m", "0 0 0 1 1 *", Arc::new(Noop), ScheduleOptions::default())
            .await
            .unwrap();
        c.start().await.unwrap();

        let before = c.get_job("m").await.unwrap().unwrap().next_run;
        let run = c.run_job("m").await.unwrap();
        assert_eq!(run.status, sched_storage::RunStatus::Completed);

        let after = c.get_job("m").await.unwrap().unwrap().next_run;
        assert_eq!(before, after);

        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unschedule_removes_job_and_disarms() {
        let c = Coordinator::connect("memory://").await.unwrap();
        c.schedule("j", "*/5 * * * * *", Arc::new(Noop), ScheduleOptions::default())
            .await
            .unwrap();
        c.start().await.unwrap();
        assert!(c.scheduler.is_armed("j").await);

        c.unschedule("j").await.unwrap();
        assert!(!c.scheduler.is_armed("j").await);
        assert!(c.get_job("j").await.unwrap().is_none());

        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn orphan_job_without_handler_is_not_armed_on_start() {
        let c = Coordinator::connect("memory://").await.unwrap();
        let job = Job::new("orphan".into(), "*/5 * * * * *".into(), JobOptions::default());
        c.storage.save_job(&job).await.unwrap();

        c.start().await.unwrap();
        assert!(!c.scheduler.is_armed("orphan").await);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn success_callback_fires_on_manual_run() {
        let c = Coordinator::connect("memory://").await.unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();

        let options = ScheduleOptions {
            on_success: Some(Arc::new(move |_value| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        c.schedule("j", "*/5 * * * * *", Arc::new(Noop), options).await.unwrap();
        c.run_job("j").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
