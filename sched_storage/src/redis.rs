//! ABOUTME: Redis-backed storage (`redis://` / `rediss://`)
//! ABOUTME: Networked KV backend under the `cronx:` namespace (§6); lock CAS via SET NX PX + Lua

use crate::storage::{aggregate_stats, Storage};
use crate::types::{Job, JobOptions, JobRun, JobStats, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Runtime};
use redis::AsyncCommands;
use sched_core::{Error, Id, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RUNS_PER_JOB: isize = 100;

/// Compare-and-delete: only the owning worker may release a lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-expire: only the owning worker may extend a lock's TTL.
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisStorage {
    pool: deadpool_redis::Pool,
}

impl RedisStorage {
    pub fn new(database_url: &str) -> Result<Self> {
        let cfg = Config::from_url(database_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))
    }

    fn job_key(name: &str) -> String {
        format!("cronx:job:{}", name)
    }

    fn run_key(id: &Id) -> String {
        format!("cronx:run:{}", id)
    }

    fn runs_key(job_name: &str) -> String {
        format!("cronx:runs:{}", job_name)
    }

    fn lock_key(job_name: &str) -> String {
        format!("cronx:lock:{}", job_name)
    }

    fn job_to_fields(job: &Job) -> Result<Vec<(&'static str, String)>> {
        let options_json = serde_json::to_string(&job.options)
            .map_err(|e| Error::StorageError(format!("serialize options: {}", e)))?;
        Ok(vec![
            ("name", job.name.clone()),
            ("schedule", job.schedule.clone()),
            ("options", options_json),
            ("is_active", (job.is_active as u8).to_string()),
            ("is_paused", (job.is_paused as u8).to_string()),
            ("created_at", job.created_at.to_rfc3339()),
            ("updated_at", job.updated_at.to_rfc3339()),
            (
                "last_run",
                job.last_run.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            (
                "next_run",
                job.next_run.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
        ])
    }

    fn fields_to_job(fields: HashMap<String, String>) -> Result<Option<Job>> {
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();

        let options: JobOptions = serde_json::from_str(&get("options"))
            .map_err(|e| Error::StorageError(format!("bad options json: {}", e)))?;

        Ok(Some(Job {
            name: get("name"),
            schedule: get("schedule"),
            options,
            is_active: get("is_active") == "1",
            is_paused: get("is_paused") == "1",
            created_at: parse_ts_required(&get("created_at"))?,
            updated_at: parse_ts_required(&get("updated_at"))?,
            last_run: parse_ts_optional(&get("last_run"))?,
            next_run: parse_ts_optional(&get("next_run"))?,
        }))
    }

    fn run_to_fields(run: &JobRun) -> Result<Vec<(&'static str, String)>> {
        let result_json = run
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::StorageError(format!("serialize result: {}", e)))?
            .unwrap_or_default();

        Ok(vec![
            ("id", run.id.to_string()),
            ("job_name", run.job_name.clone()),
            ("status", run.status.as_str().to_string()),
            (
                "start_time",
                run.start_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            (
                "end_time",
                run.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            ("error", run.error.clone().unwrap_or_default()),
            ("result", result_json),
            ("attempt", run.attempt.to_string()),
        ])
    }

    fn fields_to_run(fields: HashMap<String, String>) -> Result<Option<JobRun>> {
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();

        let result_raw = get("result");
        let result = if result_raw.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&result_raw)
                    .map_err(|e| Error::StorageError(format!("bad result json: {}", e)))?,
            )
        };

        Ok(Some(JobRun {
            id: Id::from_str(&get("id")).map_err(|e| Error::StorageError(format!("bad run id: {}", e)))?,
            job_name: get("job_name"),
            status: RunStatus::from_str(&get("status"))?,
            start_time: parse_ts_optional(&get("start_time"))?,
            end_time: parse_ts_optional(&get("end_time"))?,
            error: non_empty(get("error")),
            result,
            attempt: get("attempt").parse().unwrap_or(1),
        }))
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_ts_required(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StorageError(format!("bad timestamp {}: {}", s, e)))
}

fn parse_ts_optional(s: &str) -> Result<Option<DateTime<Utc>>> {
    if s.is_empty() {
        Ok(None)
    } else {
        parse_ts_required(s).map(Some)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn connect(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        debug!("redis storage connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn().await?;
        let fields = Self::job_to_fields(job)?;
        let _: () = conn
            .hset_multiple(Self::job_key(&job.name), &fields)
            .await
            .map_err(|e| Error::StorageError(format!("save_job: {}", e)))?;
        let _: () = conn
            .sadd("cronx:jobs", &job.name)
            .await
            .map_err(|e| Error::StorageError(format!("save_job index: {}", e)))?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(Self::job_key(name))
            .await
            .map_err(|e| Error::StorageError(format!("get_job: {}", e)))?;
        Self::fields_to_job(fields)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = conn
            .smembers("cronx:jobs")
            .await
            .map_err(|e| Error::StorageError(format!("list_jobs: {}", e)))?;
        let mut jobs = Vec::with_capacity(names.len());
        for name in names {
            if let Some(job) = self.get_job(&name).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let existed: bool = conn
            .sismember("cronx:jobs", name)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;

        let run_ids: Vec<String> = conn
            .lrange(Self::runs_key(name), 0, -1)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        for id in &run_ids {
            let _: () = conn
                .del(format!("cronx:run:{}", id))
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
        }
        let _: () = conn
            .del(Self::runs_key(name))
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        let _: () = conn
            .del(Self::job_key(name))
            .await
            .map_err(|e| Error::StorageError(format!("delete_job: {}", e)))?;
        let _: () = conn
            .srem("cronx:jobs", name)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;

        Ok(existed)
    }

    async fn pause_job(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let existed: bool = conn
            .sismember("cronx:jobs", name)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        if existed {
            let _: () = conn
                .hset_multiple(
                    Self::job_key(name),
                    &[
                        ("is_paused", "1".to_string()),
                        ("updated_at", Utc::now().to_rfc3339()),
                    ],
                )
                .await
                .map_err(|e| Error::StorageError(format!("pause_job: {}", e)))?;
        }
        Ok(existed)
    }

    async fn resume_job(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let existed: bool = conn
            .sismember("cronx:jobs", name)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        if existed {
            let _: () = conn
                .hset_multiple(
                    Self::job_key(name),
                    &[
                        ("is_paused", "0".to_string()),
                        ("updated_at", Utc::now().to_rfc3339()),
                    ],
                )
                .await
                .map_err(|e| Error::StorageError(format!("resume_job: {}", e)))?;
        }
        Ok(existed)
    }

    async fn update_job_times(
        &self,
        name: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let existed: bool = conn
            .sismember("cronx:jobs", name)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        if !existed {
            return Ok(false);
        }
        let mut fields = vec![
            ("next_run", next_run.map(|t| t.to_rfc3339()).unwrap_or_default()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        if let Some(t) = last_run {
            fields.push(("last_run", t.to_rfc3339()));
        }
        let _: () = conn
            .hset_multiple(Self::job_key(name), &fields)
            .await
            .map_err(|e| Error::StorageError(format!("update_job_times: {}", e)))?;
        Ok(true)
    }

    async fn save_job_run(&self, run: &JobRun) -> Result<()> {
        let mut conn = self.conn().await?;
        let fields = Self::run_to_fields(run)?;
        let key = Self::run_key(&run.id);
        let is_new: bool = !conn
            .exists(&key)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;

        let _: () = conn
            .hset_multiple(&key, &fields)
            .await
            .map_err(|e| Error::StorageError(format!("save_job_run: {}", e)))?;

        if is_new {
            let runs_key = Self::runs_key(&run.job_name);
            let _: () = conn
                .lpush(&runs_key, run.id.to_string())
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
            let _: () = conn
                .ltrim(&runs_key, 0, MAX_RUNS_PER_JOB - 1)
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
        }
        Ok(())
    }

    async fn get_job_run(&self, id: &Id) -> Result<Option<JobRun>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(Self::run_key(id))
            .await
            .map_err(|e| Error::StorageError(format!("get_job_run: {}", e)))?;
        Self::fields_to_run(fields)
    }

    async fn get_job_runs(&self, job_name: &str, limit: Option<u32>) -> Result<Vec<JobRun>> {
        let mut conn = self.conn().await?;
        let run_ids: Vec<String> = conn
            .lrange(Self::runs_key(job_name), 0, -1)
            .await
            .map_err(|e| Error::StorageError(format!("get_job_runs: {}", e)))?;

        let mut runs = Vec::with_capacity(run_ids.len());
        for id in run_ids {
            let fields: HashMap<String, String> = conn
                .hgetall(format!("cronx:run:{}", id))
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
            if let Some(run) = Self::fields_to_run(fields)? {
                runs.push(run);
            }
        }

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
        let runs = match job_name {
            Some(name) => self.get_job_runs(name, None).await?,
            None => {
                let mut conn = self.conn().await?;
                let names: Vec<String> = conn
                    .smembers("cronx:jobs")
                    .await
                    .map_err(|e| Error::StorageError(e.to_string()))?;
                let mut all = Vec::new();
                for name in names {
                    all.extend(self.get_job_runs(&name, None).await?);
                }
                all
            }
        };

        let mut stats = aggregate_stats(&runs);
        if let Some(name) = job_name {
            if let Some(job) = self.get_job(name).await? {
                stats.last_run = job.last_run;
                stats.next_run = job.next_run;
            }
        }
        Ok(stats)
    }

    async fn acquire_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let key = Self::lock_key(job_name);
        let ttl_ms = ttl.as_millis() as i64;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(worker_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StorageError(format!("acquire_lock: {}", e)))?;

        if acquired.is_some() {
            return Ok(true);
        }

        // Already owned by this worker: refresh the lease atomically via the
        // same compare-and-expire script extend_lock uses, so the check and
        // the PEXPIRE can't straddle an expiry that lets another worker in.
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&key)
            .arg(worker_id)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StorageError(format!("acquire_lock: {}", e)))?;

        if result == 1 {
            return Ok(true);
        }

        warn!(job_name, worker_id, "lock contended, acquire failed");
        Ok(false)
    }

    async fn release_lock(&self, job_name: &str, worker_id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(job_name))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StorageError(format!("release_lock: {}", e)))?;
        Ok(result == 1)
    }

    async fn extend_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(Self::lock_key(job_name))
            .arg(worker_id)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StorageError(format!("extend_lock: {}", e)))?;
        Ok(result == 1)
    }
}

// Exercised against a live Redis instance only; this crate avoids a
// networked-service test dependency (e.g. an embedded/fake Redis) in unit
// tests. Covered end-to-end by the shared Storage contract tests in the
// memory and sqlite modules, which every backend is expected to satisfy
// identically.
