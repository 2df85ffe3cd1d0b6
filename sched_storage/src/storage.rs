//! ABOUTME: The Storage trait — the persistence contract every backend must satisfy
//! ABOUTME: See §4.2 of the design spec for the full semantic contract

use crate::types::{Job, JobRun, JobStats, RunStatus};
use async_trait::async_trait;
use sched_core::Result;
use std::time::Duration;

/// A single interface with six operation groups (§4.2). Every backend —
/// memory, sqlite, postgres, redis — must satisfy identical observable
/// behavior; only the mechanism used to guarantee atomicity differs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Scoped resource acquisition. Must create any missing schema
    /// idempotently. Fails with `StorageUnavailable` on connection loss.
    async fn connect(&self) -> Result<()>;

    /// Release any held connections/resources.
    async fn disconnect(&self) -> Result<()>;

    /// Upsert by `name`; full overwrite of fields. Concurrent upserts of
    /// the same name resolve last-writer-wins.
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, name: &str) -> Result<Option<Job>>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Returns `true` iff a record existed and was deleted. Cascades to the
    /// job's runs.
    async fn delete_job(&self, name: &str) -> Result<bool>;

    /// Sets `is_paused = true` and bumps `updated_at`. Returns `true` iff a
    /// record existed. Idempotent.
    async fn pause_job(&self, name: &str) -> Result<bool>;

    /// Sets `is_paused = false` and bumps `updated_at`. Returns `true` iff a
    /// record existed. Idempotent.
    async fn resume_job(&self, name: &str) -> Result<bool>;

    /// Record `job.last_run`/`job.next_run`, bumping `updated_at`. Returns
    /// `true` iff a record existed.
    async fn update_job_times(
        &self,
        name: &str,
        last_run: Option<chrono::DateTime<chrono::Utc>>,
        next_run: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<bool>;

    /// Upsert by `id`; a run's identity is stable across status
    /// transitions, so pending→running→completed produces one row.
    async fn save_job_run(&self, run: &JobRun) -> Result<()>;

    async fn get_job_run(&self, id: &sched_core::Id) -> Result<Option<JobRun>>;

    /// Ordered by `start_time` descending, null `start_time` sorted last,
    /// ties broken by `attempt` descending. `limit`, when present, bounds
    /// the result.
    async fn get_job_runs(&self, job_name: &str, limit: Option<u32>) -> Result<Vec<JobRun>>;

    /// Aggregate over runs: totals, successes (status=completed), failures
    /// (status=failed), mean duration over runs with both timestamps. When
    /// `job_name` is supplied, also populate `last_run`/`next_run` from the
    /// Job record.
    async fn get_job_stats(&self, job_name: Option<&str>) -> Result<JobStats>;

    /// Atomic. Succeeds iff no lock exists, the existing lock has expired,
    /// or the existing lock is already owned by `worker_id`.
    async fn acquire_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool>;

    /// Deletes the record only if `worker_id` matches. Stale calls are
    /// no-ops (return `false`).
    async fn release_lock(&self, job_name: &str, worker_id: &str) -> Result<bool>;

    /// Updates `expires_at` only if `worker_id` matches ownership.
    async fn extend_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool>;
}

/// Shared helper: compute `JobStats` from an already-fetched run list. Used
/// by backends whose native aggregate queries would otherwise duplicate
/// this arithmetic (§4.2 "averageDuration... mean... over runs with both
/// timestamps").
pub fn aggregate_stats(runs: &[JobRun]) -> JobStats {
    let total_runs = runs.len() as u64;
    let successful_runs = runs
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .count() as u64;
    let failed_runs = runs.iter().filter(|r| r.status == RunStatus::Failed).count() as u64;

    let durations: Vec<i64> = runs
        .iter()
        .filter_map(|r| match (r.start_time, r.end_time) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
            _ => None,
        })
        .collect();

    let average_duration_ms = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
    };

    JobStats {
        total_runs,
        successful_runs,
        failed_runs,
        average_duration_ms,
        last_run: None,
        next_run: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobRun;
    use chrono::{Duration as ChronoDuration, Utc};

    fn completed_run(start_offset_secs: i64, duration_ms: i64) -> JobRun {
        let start = Utc::now() + ChronoDuration::seconds(start_offset_secs);
        JobRun {
            id: sched_core::Id::new(),
            job_name: "j".to_string(),
            status: RunStatus::Completed,
            start_time: Some(start),
            end_time: Some(start + ChronoDuration::milliseconds(duration_ms)),
            error: None,
            result: None,
            attempt: 1,
        }
    }

    #[test]
    fn aggregate_stats_averages_only_runs_with_both_timestamps() {
        let mut runs = vec![completed_run(0, 100), completed_run(10, 300)];
        runs.push(JobRun {
            id: sched_core::Id::new(),
            job_name: "j".to_string(),
            status: RunStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            result: None,
            attempt: 1,
        });

        let stats = aggregate_stats(&runs);
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.successful_runs, 2);
        assert_eq!(stats.average_duration_ms, Some(200.0));
    }

    #[test]
    fn aggregate_stats_counts_failures() {
        let mut failed = completed_run(0, 50);
        failed.status = RunStatus::Failed;
        let runs = vec![failed];
        let stats = aggregate_stats(&runs);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.successful_runs, 0);
    }
}
