//! ABOUTME: SQLite-backed storage (`sqlite://PATH`)
//! ABOUTME: File-backed embedded SQL backend; lock CAS via single-statement upsert

use crate::storage::{aggregate_stats, Storage};
use crate::types::{Job, JobOptions, JobRun, JobStats, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sched_core::{Error, Id, Result};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Build a pool against `sqlite://PATH`, creating the file if missing.
    pub async fn new(database_url: &str) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<Job> {
        let options_str: String = row.get("options");
        let options: JobOptions = serde_json::from_str(&options_str)
            .map_err(|e| Error::StorageError(format!("bad options json: {}", e)))?;

        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let last_run: Option<String> = row.get("last_run");
        let next_run: Option<String> = row.get("next_run");

        Ok(Job {
            name: row.get("name"),
            schedule: row.get("schedule"),
            options,
            is_active: row.get::<i32, _>("is_active") != 0,
            is_paused: row.get::<i32, _>("is_paused") != 0,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            last_run: last_run.as_deref().map(parse_ts).transpose()?,
            next_run: next_run.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn row_to_run(&self, row: sqlx::sqlite::SqliteRow) -> Result<JobRun> {
        let id_str: String = row.get("id");
        let status_str: String = row.get("status");
        let start_time: Option<String> = row.get("start_time");
        let end_time: Option<String> = row.get("end_time");
        let result_str: Option<String> = row.get("result");

        Ok(JobRun {
            id: Id::from_str(&id_str)
                .map_err(|e| Error::StorageError(format!("bad run id: {}", e)))?,
            job_name: row.get("job_name"),
            status: RunStatus::from_str(&status_str)?,
            start_time: start_time.as_deref().map(parse_ts).transpose()?,
            end_time: end_time.as_deref().map(parse_ts).transpose()?,
            error: row.get("error"),
            result: result_str
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| Error::StorageError(format!("bad result json: {}", e)))?,
            attempt: row.get::<i64, _>("attempt") as u32,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StorageError(format!("bad timestamp {}: {}", s, e)))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn connect(&self) -> Result<()> {
        debug!("running sqlite schema migration");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                name TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                options TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run TEXT,
                next_run TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("create jobs table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                error TEXT,
                result TEXT,
                attempt INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("create job_runs table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                job_name TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("create locks table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runs_job_name ON job_runs (job_name)")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runs_start_time ON job_runs (start_time)")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_locks_expires_at ON locks (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;

        debug!("sqlite schema ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let options_json = serde_json::to_string(&job.options)
            .map_err(|e| Error::StorageError(format!("serialize options: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (name, schedule, options, is_active, is_paused, created_at, updated_at, last_run, next_run)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(name) DO UPDATE SET
                schedule = excluded.schedule,
                options = excluded.options,
                is_active = excluded.is_active,
                is_paused = excluded.is_paused,
                updated_at = excluded.updated_at,
                last_run = excluded.last_run,
                next_run = excluded.next_run
            "#,
        )
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&options_json)
        .bind(job.is_active as i32)
        .bind(job.is_paused as i32)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.last_run.map(|t| t.to_rfc3339()))
        .bind(job.next_run.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("save_job: {}", e)))?;

        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_job: {}", e)))?;
        row.map(|r| self.row_to_job(r)).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("list_jobs: {}", e)))?;
        rows.into_iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        sqlx::query("DELETE FROM job_runs WHERE job_name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("cascade delete runs: {}", e)))?;

        let result = sqlx::query("DELETE FROM jobs WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("delete_job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn pause_job(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_paused = 1, updated_at = ?1 WHERE name = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("pause_job: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_job(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_paused = 0, updated_at = ?1 WHERE name = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("resume_job: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_job_times(
        &self,
        name: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = if last_run.is_some() {
            sqlx::query(
                "UPDATE jobs SET last_run = ?1, next_run = ?2, updated_at = ?3 WHERE name = ?4",
            )
            .bind(last_run.map(|t| t.to_rfc3339()))
            .bind(next_run.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("UPDATE jobs SET next_run = ?1, updated_at = ?2 WHERE name = ?3")
                .bind(next_run.map(|t| t.to_rfc3339()))
                .bind(Utc::now().to_rfc3339())
                .bind(name)
                .execute(&self.pool)
                .await
        }
        .map_err(|e| Error::StorageError(format!("update_job_times: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_job_run(&self, run: &JobRun) -> Result<()> {
        let result_json = run
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::StorageError(format!("serialize result: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job_name, status, start_time, end_time, error, result, attempt)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                error = excluded.error,
                result = excluded.result,
                attempt = excluded.attempt
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.job_name)
        .bind(run.status.as_str())
        .bind(run.start_time.map(|t| t.to_rfc3339()))
        .bind(run.end_time.map(|t| t.to_rfc3339()))
        .bind(&run.error)
        .bind(result_json)
        .bind(run.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("save_job_run: {}", e)))?;

        Ok(())
    }

    async fn get_job_run(&self, id: &Id) -> Result<Option<JobRun>> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_job_run: {}", e)))?;
        row.map(|r| self.row_to_run(r)).transpose()
    }

    async fn get_job_runs(&self, job_name: &str, limit: Option<u32>) -> Result<Vec<JobRun>> {
        let query = format!(
            "SELECT * FROM job_runs WHERE job_name = ?1 \
             ORDER BY start_time IS NULL, start_time DESC, attempt DESC{}",
            limit.map_or_else(String::new, |l| format!(" LIMIT {}", l))
        );

        let rows = sqlx::query(&query)
            .bind(job_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_job_runs: {}", e)))?;

        rows.into_iter().map(|r| self.row_to_run(r)).collect()
    }

    async fn get_job_stats(&self, job_name: Option<&str>) -> Result<JobStats> {
        let rows = match job_name {
            Some(name) => {
                sqlx::query("SELECT * FROM job_runs WHERE job_name = ?1")
                    .bind(name)
                    .fetch_all(&self.pool)
                    .await
            }
            None => sqlx::query("SELECT * FROM job_runs").fetch_all(&self.pool).await,
        }
        .map_err(|e| Error::StorageError(format!("get_job_stats: {}", e)))?;

        let runs: Vec<JobRun> = rows
            .into_iter()
            .map(|r| self.row_to_run(r))
            .collect::<Result<_>>()?;

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
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| Error::StorageError(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO locks (job_name, worker_id, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(job_name) DO UPDATE SET
                worker_id = excluded.worker_id,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?4 OR locks.worker_id = ?2
            "#,
        )
        .bind(job_name)
        .bind(worker_id)
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("acquire_lock: {}", e)))?;

        let acquired = result.rows_affected() > 0;
        if !acquired {
            warn!(job_name, worker_id, "lock contended, acquire failed");
        }
        Ok(acquired)
    }

    async fn release_lock(&self, job_name: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE job_name = ?1 AND worker_id = ?2")
            .bind(job_name)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("release_lock: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend_lock(&self, job_name: &str, worker_id: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| Error::StorageError(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE locks SET expires_at = ?1 WHERE job_name = ?2 AND worker_id = ?3",
        )
        .bind(expires_at.to_rfc3339())
        .bind(job_name)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("extend_lock: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}
