//! ABOUTME: Per-job timers that fire the Executor at each job's next scheduled instant
//! ABOUTME: One task per armed job; at-most-one-catch-up policy (§4.4)

use crate::executor::Executor;
use crate::handler::Callbacks;
use chrono_tz::Tz;
use sched_core::clock;
use sched_storage::{Job, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct ArmedJob {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns a mapping from job name to its armed timer task. Timer callbacks
/// run on one logical task per job; handler invocations run on the
/// Executor's own tasks so a long-running job never stalls another job's
/// timer (§5).
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    executor: Arc<Executor>,
    armed: Mutex<HashMap<String, ArmedJob>>,
    zone: Tz,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn Storage>, executor: Arc<Executor>) -> Self {
        Self {
            storage,
            executor,
            armed: Mutex::new(HashMap::new()),
            zone: clock::default_zone(),
        }
    }

    /// Arm a timer for `job`, handing each fire to the Executor with
    /// `handler`/`callbacks`. Replaces any existing timer for the same name.
    pub async fn arm(&self, job: Job, handler: Arc<dyn crate::handler::JobHandler>, callbacks: Callbacks) {
        self.disarm(&job.name).await;

        let cancel = CancellationToken::new();
        let storage = self.storage.clone();
        let executor = self.executor.clone();
        let zone = self.zone;
        let job_name = job.name.clone();
        let cancel_for_task = cancel.clone();

        let task = tokio::spawn(async move {
            let mut job = job;
            loop {
                let next = match clock::next_fire(&job.schedule, clock::now(), zone) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(job_name = %job.name, error = %e, "failed to compute next fire, disarming");
                        return;
                    }
                };

                job.next_run = Some(next);
                let _ = storage.update_job_times(&job.name, None, Some(next)).await;

                let sleep_duration = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);

                tokio::select! {
                    _ = cancel_for_task.cancelled() => {
                        info!(job_name = %job.name, "timer cancelled, disarming");
                        return;
                    }
                    _ = tokio::time::sleep(sleep_duration) => {}
                }

                let _ = storage.update_job_times(&job.name, Some(next), None).await;

                // Reload the latest record so pause/resume and option edits
                // made elsewhere are honored on the next fire.
                match storage.get_job(&job.name).await {
                    Ok(Some(latest)) => job = latest,
                    Ok(None) => {
                        info!(job_name = %job.name, "job deleted, disarming");
                        return;
                    }
                    Err(e) => {
                        warn!(job_name = %job.name, error = %e, "failed to reload job, using stale copy");
                    }
                }

                let executor = executor.clone();
                let fired_job = job.clone();
                let handler = handler.clone();
                let callbacks = callbacks.clone();

                tokio::spawn(async move {
                    if let Err(e) = executor.run(&fired_job, handler, &callbacks).await {
                        // §7: scheduled invocations log the error and do not
                        // propagate — there is no caller to receive it.
                        error!(job_name = %fired_job.name, error = %e, "scheduled execution failed after retries");
                    }
                });
            }
        });

        self.armed.lock().await.insert(
            job_name,
            ArmedJob {
                cancel,
                task,
            },
        );
    }

    /// Disarm and drop a job's timer immediately, if armed.
    pub async fn disarm(&self, job_name: &str) {
        if let Some(armed) = self.armed.lock().await.remove(job_name) {
            armed.cancel.cancel();
            armed.task.abort();
        }
    }

    /// Cancel every armed timer. In-flight executions already handed to the
    /// Executor continue to completion (§4.4).
    pub async fn stop_all(&self) {
        let mut armed = self.armed.lock().await;
        for (_, job) in armed.drain() {
            job.cancel.cancel();
            job.task.abort();
        }
    }

    pub async fn is_armed(&self, job_name: &str) -> bool {
        self.armed.lock().await.contains_key(job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use sched_storage::memory::MemoryStorage;
    use sched_storage::JobOptions;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler(Arc<AtomicU32>);
    #[async_trait::async_trait]
    impl crate::handler::JobHandler for CountingHandler {
        async fn execute(&self, _context: crate::handler::JobContext) -> sched_core::Result<serde_json::Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test]
    async fn heartbeat_fires_roughly_on_schedule() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let executor = Arc::new(Executor::new(storage.clone(), "w1", Arc::new(NoopMetricsSink)));
        let scheduler = Scheduler::new(storage.clone(), executor);

        let job = Job::new("hb".into(), "*/1 * * * * *".into(), JobOptions::default());
        storage.save_job(&job).await.unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.arm(job, Arc::new(CountingHandler(counter.clone())), Callbacks::default()).await;
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        scheduler.stop_all().await;

        let count = counter.load(Ordering::SeqCst);
        assert!(count >= 1 && count <= 4, "expected 1-4 fires in 2.5s at 1s cadence, got {}", count);
    }

    #[tokio::test]
    async fn disarm_stops_further_fires() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let executor = Arc::new(Executor::new(storage.clone(), "w1", Arc::new(NoopMetricsSink)));
        let scheduler = Scheduler::new(storage.clone(), executor);

        let job = Job::new("once".into(), "*/1 * * * * *".into(), JobOptions::default());
        storage.save_job(&job).await.unwrap();
        assert!(!scheduler.is_armed("once").await);

        scheduler.arm(job, Arc::new(CountingHandler(Arc::new(AtomicU32::new(0)))), Callbacks::default()).await;
        assert!(scheduler.is_armed("once").await);

        scheduler.disarm("once").await;
        assert!(!scheduler.is_armed("once").await);
    }
}
