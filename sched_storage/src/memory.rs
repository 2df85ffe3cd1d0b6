//! ABOUTME: In-process ephemeral storage backend (`memory://`)
//! ABOUTME: Single mutex-guarded map set — used as the default/test backend

use crate::storage::{aggregate_stats, Storage};
use crate::types::{Job, JobRun, JobStats, Lock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sched_core::{Error, Id, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    runs: HashMap<Id, JobRun>,
    locks: HashMap<String, Lock>,
}

/// Ephemeral in-memory storage. All mutation goes through one `Mutex`, so
/// lock acquisition is a true check-and-write critical section rather than
/// the forbidden read-then-write race (§4.2).
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> Result<()> {
        debug!("memory storage connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.lock_state().jobs.insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.lock_state().jobs.get(name).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.lock_state().jobs.values().cloned().collect())
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        let mut state = self.lock_state();
        let existed = state.jobs.remove(name).is_some();
        state.runs.retain(|_, r| r.job_name != name);
        Ok(existed)
    }

    async fn pause_job(&self, name: &str) -> Result<bool> {
        let mut state = self.lock_state();
        if let Some(job) = state.jobs.get_mut(name) {
            job.is_paused = true;
            job.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn resume_job(&self, name: &str) -> Result<bool> {
        let mut state = self.lock_state();
        if let Some(job) = state.jobs.get_mut(name) {
            job.is_paused = false;
            job.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn update_job_times(
        &self,
        name: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.lock_state();
        if let Some(job) = state.jobs.get_mut(name) {
            if last_run.is_some() {
                job.last_run = last_run;
            }
            job.next_run = next_run;
            job.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn save_job_run(&self, run: &JobRun) -> Result<()> {
        self.lock_state().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_job_run(&self, id: &Id) -> Result<Option<JobRun>> {
        Ok(self.lock_state().runs.get(id).cloned())
    }

    async fn get_job_runs(&self, job_name: &str, limit: Option<u32>) -> Result<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .lock_state()
            .runs
            .values()
            .filter(|r| r.job_name == job_name)
            .cloned()
            .collect();

        runs.sort_by(|a, b| match (b.start_time, a.start_time) {
            (Some(bt), Some(at)) => bt.cmp(&at).then(b.attempt.cmp(&a.attempt)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.attempt.cmp(&a.attempt),
        });

        if let Some(limit) = limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn get_job_stats(&self, job_name: Option<&str>) -> Result<JobStats> {
        let state = self.lock_state();
        let runs: Vec<JobRun> = match job_name {
            Some(name) => state
                .runs
                .values()
                .filter(|r| r.job_name == name)
                .cloned()
                .collect(),
            None => state.runs.values().cloned().collect(),
        };
        let mut stats = aggregate_stats(&runs);
        if let Some(name) = job_name {
            if let Some(job) = state.jobs.get(name) {
                stats.last_run = job.last_run;
                stats.next_run = job.next_run;
            }
        }
        Ok(stats)
    }

    async fn acquire_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock_state();
        let now = Utc::now();
        let can_take = match state.locks.get(job_name) {
            None => true,
            Some(existing) => existing.is_expired(now) || existing.worker_id == worker_id,
        };
        if can_take {
            let expires_at = now
                + chrono::Duration::from_std(ttl)
                    .map_err(|e| Error::StorageError(e.to_string()))?;
            state.locks.insert(
                job_name.to_string(),
                Lock {
                    job_name: job_name.to_string(),
                    worker_id: worker_id.to_string(),
                    expires_at,
                },
            );
        }
        Ok(can_take)
    }

    async fn release_lock(&self, job_name: &str, worker_id: &str) -> Result<bool> {
        let mut state = self.lock_state();
        match state.locks.get(job_name) {
            Some(existing) if existing.worker_id == worker_id => {
                state.locks.remove(job_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock_state();
        match state.locks.get_mut(job_name) {
            Some(existing) if existing.worker_id == worker_id => {
                existing.expires_at = Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| Error::StorageError(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOptions;

    fn storage() -> MemoryStorage {
        MemoryStorage::new()
    }

    #[tokio::test]
    async fn save_and_get_job_roundtrip() {
        let s = storage();
        let job = Job::new("j1".into(), "*/5 * * * * *".into(), JobOptions::default());
        s.save_job(&job).await.unwrap();
        let fetched = s.get_job("j1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "j1");
    }

    #[tokio::test]
    async fn delete_job_is_idempotent() {
        let s = storage();
        let job = Job::new("j1".into(), "*/5 * * * * *".into(), JobOptions::default());
        s.save_job(&job).await.unwrap();
        assert!(s.delete_job("j1").await.unwrap());
        assert!(!s.delete_job("j1").await.unwrap());
    }

    #[tokio::test]
    async fn pause_job_idempotent_and_sets_flag() {
        let s = storage();
        let job = Job::new("j1".into(), "*/5 * * * * *".into(), JobOptions::default());
        s.save_job(&job).await.unwrap();
        assert!(s.pause_job("j1").await.unwrap());
        assert!(s.pause_job("j1").await.unwrap());
        assert!(s.get_job("j1").await.unwrap().unwrap().is_paused);
    }

    #[tokio::test]
    async fn lock_roundtrip_full_cycle() {
        let s = storage();
        assert!(s.acquire_lock("j", "w1", Duration::from_millis(500)).await.unwrap());
        assert!(s.extend_lock("j", "w1", Duration::from_millis(500)).await.unwrap());
        assert!(s.release_lock("j", "w1").await.unwrap());
        assert!(s.acquire_lock("j", "w2", Duration::from_millis(500)).await.unwrap());
    }

    #[tokio::test]
    async fn second_worker_cannot_steal_live_lock() {
        let s = storage();
        assert!(s.acquire_lock("j", "w1", Duration::from_secs(60)).await.unwrap());
        assert!(!s.acquire_lock("j", "w2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_evictable_by_any_contender() {
        let s = storage();
        assert!(s.acquire_lock("j", "w1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(s.acquire_lock("j", "w2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn release_after_release_is_noop() {
        let s = storage();
        s.acquire_lock("j", "w1", Duration::from_secs(60)).await.unwrap();
        assert!(s.release_lock("j", "w1").await.unwrap());
        assert!(!s.release_lock("j", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn get_job_runs_orders_by_start_time_desc_nulls_last() {
        let s = storage();
        let now = Utc::now();
        let mut r1 = JobRun::new_pending("j".into(), 1);
        r1.start_time = Some(now - chrono::Duration::seconds(10));
        let mut r2 = JobRun::new_pending("j".into(), 2);
        r2.start_time = Some(now);
        let r3 = JobRun::new_pending("j".into(), 3); // no start_time

        s.save_job_run(&r1).await.unwrap();
        s.save_job_run(&r2).await.unwrap();
        s.save_job_run(&r3).await.unwrap();

        let runs = s.get_job_runs("j", None).await.unwrap();
        assert_eq!(runs[0].attempt, 2);
        assert_eq!(runs[1].attempt, 1);
        assert_eq!(runs[2].attempt, 3);
    }

    #[tokio::test]
    async fn get_job_runs_honors_limit() {
        let s = storage();
        for i in 0..5u32 {
            let mut r = JobRun::new_pending("j".into(), i + 1);
            r.start_time = Some(Utc::now());
            s.save_job_run(&r).await.unwrap();
        }
        let runs = s.get_job_runs("j", Some(2)).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_acquire_lock_only_one_wins() {
        use std::sync::Arc;
        let s = Arc::new(storage());
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.acquire_lock("shared", &format!("w{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
