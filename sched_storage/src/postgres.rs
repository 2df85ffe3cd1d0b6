//! ABOUTME: Postgres-backed storage (`postgres://` / `postgresql://`)
//! ABOUTME: Networked SQL backend; lock CAS via single-statement upsert, same schema contract as sqlite

use crate::storage::{aggregate_stats, Storage};
use crate::types::{Job, JobOptions, JobRun, JobStats, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sched_core::{Error, Id, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    fn row_to_job(&self, row: sqlx::postgres::PgRow) -> Result<Job> {
        let options_str: String = row.get("options");
        let options: JobOptions = serde_json::from_str(&options_str)
            .map_err(|e| Error::StorageError(format!("bad options json: {}", e)))?;

        Ok(Job {
            name: row.get("name"),
            schedule: row.get("schedule"),
            options,
            is_active: row.get("is_active"),
            is_paused: row.get("is_paused"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_run: row.get("last_run"),
            next_run: row.get("next_run"),
        })
    }

    fn row_to_run(&self, row: sqlx::postgres::PgRow) -> Result<JobRun> {
        let id_str: String = row.get("id");
        let status_str: String = row.get("status");
        let result_str: Option<String> = row.get("result");

        Ok(JobRun {
            id: Id::from_str(&id_str)
                .map_err(|e| Error::StorageError(format!("bad run id: {}", e)))?,
            job_name: row.get("job_name"),
            status: RunStatus::from_str(&status_str)?,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            error: row.get("error"),
            result: result_str
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| Error::StorageError(format!("bad result json: {}", e)))?,
            attempt: row.get::<i32, _>("attempt") as u32,
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn connect(&self) -> Result<()> {
        debug!("running postgres schema migration");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                name TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                options TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                is_paused BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                last_run TIMESTAMPTZ,
                next_run TIMESTAMPTZ
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
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                error TEXT,
                result TEXT,
                attempt INT NOT NULL
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
                expires_at TIMESTAMPTZ NOT NULL
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

        debug!("postgres schema ready");
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE SET
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
        .bind(job.is_active)
        .bind(job.is_paused)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_run)
        .bind(job.next_run)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("save_job: {}", e)))?;

        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE name = $1")
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;

        sqlx::query("DELETE FROM job_runs WHERE job_name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageError(format!("cascade delete runs: {}", e)))?;

        let result = sqlx::query("DELETE FROM jobs WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageError(format!("delete_job: {}", e)))?;

        tx.commit().await.map_err(|e| Error::StorageError(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn pause_job(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_paused = TRUE, updated_at = $1 WHERE name = $2")
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("pause_job: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_job(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_paused = FALSE, updated_at = $1 WHERE name = $2")
            .bind(Utc::now())
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
                "UPDATE jobs SET last_run = $1, next_run = $2, updated_at = $3 WHERE name = $4",
            )
            .bind(last_run)
            .bind(next_run)
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("UPDATE jobs SET next_run = $1, updated_at = $2 WHERE name = $3")
                .bind(next_run)
                .bind(Utc::now())
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
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
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(&run.error)
        .bind(result_json)
        .bind(run.attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("save_job_run: {}", e)))?;

        Ok(())
    }

    async fn get_job_run(&self, id: &Id) -> Result<Option<JobRun>> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_job_run: {}", e)))?;
        row.map(|r| self.row_to_run(r)).transpose()
    }

    async fn get_job_runs(&self, job_name: &str, limit: Option<u32>) -> Result<Vec<JobRun>> {
        let query = format!(
            "SELECT * FROM job_runs WHERE job_name = $1 \
             ORDER BY start_time DESC NULLS LAST, attempt DESC{}",
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
                sqlx::query("SELECT * FROM job_runs WHERE job_name = $1")
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
            INSERT INTO locks (job_name, worker_id, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE SET
                worker_id = excluded.worker_id,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= $4 OR locks.worker_id = $2
            "#,
        )
        .bind(job_name)
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
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
        let result = sqlx::query("DELETE FROM locks WHERE job_name = $1 AND worker_id = $2")
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
            "UPDATE locks SET expires_at = $1 WHERE job_name = $2 AND worker_id = $3",
        )
        .bind(expires_at)
        .bind(job_name)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("extend_lock: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}

// Exercised against a live Postgres instance only; no unit tests here since
// this crate avoids networked-service test dependencies (see sched_storage::redis
// for the equivalent note). Covered end-to-end by the Storage contract tests
// shared across backends in the memory/sqlite modules.
