//! ABOUTME: Core data types for the job scheduling system
//! ABOUTME: Job, JobRun, Lock, and JobStats records persisted by a Storage backend

use chrono::{DateTime, Utc};
use sched_core::{Backoff, BackoffKind, Id};
use serde::{Deserialize, Serialize};

/// Options recognized on a Job (§3). Callbacks (`onSuccess`/`onError`) are
/// deliberately absent here — they are ephemeral, in-process handlers kept
/// by the registering Coordinator, never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    pub timeout_ms: Option<u64>,
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: BackoffKind::Fixed,
            timeout_ms: None,
        }
    }
}

impl JobOptions {
    /// Resolve the persisted `backoff` kind into a fully-parameterized
    /// `Backoff` using the §4.5 defaults for base/factor/max.
    pub fn resolved_backoff(&self) -> Backoff {
        match self.backoff {
            BackoffKind::Fixed => Backoff::fixed(1000),
            BackoffKind::Exponential => Backoff::exponential(1000, 2.0, 30_000),
        }
    }
}

/// A durable job record keyed by a unique `name` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub schedule: String,
    pub options: JobOptions,
    pub is_active: bool,
    pub is_paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: String, schedule: String, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            name,
            schedule,
            options,
            is_active: true,
            is_paused: false,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
        }
    }

    /// Validate invariants that aren't already enforced by the type system:
    /// non-empty name within the 1-255 char bound, and a parseable schedule.
    pub fn validate(&self) -> sched_core::Result<()> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err(sched_core::Error::InvalidConfiguration(
                "job name must be 1-255 characters".to_string(),
            ));
        }
        if self.schedule.is_empty() {
            return Err(sched_core::Error::InvalidConfiguration(
                "job schedule cannot be empty".to_string(),
            ));
        }
        sched_core::clock::validate(&self.schedule)?;
        Ok(())
    }
}

/// Execution status of a single JobRun attempt (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = sched_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(sched_core::Error::StorageError(format!(
                "unknown run status: {}",
                other
            ))),
        }
    }
}

/// The persistent record of one attempt at executing a job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Id,
    pub job_name: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub attempt: u32,
}

impl JobRun {
    pub fn new_pending(job_name: String, attempt: u32) -> Self {
        Self {
            id: Id::new(),
            job_name,
            status: RunStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            result: None,
            attempt,
        }
    }
}

/// A mutual-exclusion token over a job name, owned by a worker, bounded by
/// a TTL (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub job_name: String,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Aggregate run statistics for a job, or across all jobs (§4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub average_duration_ms: Option<f64>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_validate_rejects_empty_name() {
        let job = Job::new("".to_string(), "0 * * * * *".to_string(), JobOptions::default());
        assert!(job.validate().is_err());
    }

    #[test]
    fn job_validate_rejects_bad_schedule() {
        let job = Job::new("x".to_string(), "not a cron".to_string(), JobOptions::default());
        assert!(job.validate().is_err());
    }

    #[test]
    fn job_validate_accepts_well_formed_job() {
        let job = Job::new(
            "heartbeat".to_string(),
            "*/5 * * * * *".to_string(),
            JobOptions::default(),
        );
        assert!(job.validate().is_ok());
    }

    #[test]
    fn job_options_resolve_backoff_defaults() {
        let opts = JobOptions {
            backoff: BackoffKind::Exponential,
            ..Default::default()
        };
        let backoff = opts.resolved_backoff();
        assert_eq!(backoff.base_ms, 1000);
        assert_eq!(backoff.max_ms, 30_000);
    }
}
