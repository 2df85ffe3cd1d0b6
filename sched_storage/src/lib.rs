//! ABOUTME: Pluggable persistence layer for job, run, and lock records
//! ABOUTME: One Storage contract, four backends selected by URI scheme

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod sqlite;
pub mod storage;
pub mod types;

pub use storage::Storage;
pub use types::{Job, JobOptions, JobRun, JobStats, Lock, RunStatus};

use memory::MemoryStorage;
use postgres::PostgresStorage;
use redis::RedisStorage;
use sched_core::{Error, Result};
use sqlite::SqliteStorage;
use std::sync::Arc;

/// Construct the right backend for a storage URI and run its `connect()`.
///
/// Scheme table (§6): `memory://`, `sqlite://PATH`, `postgres(ql)?://...`,
/// `redis(s)?://...`. An unrecognized scheme is `UnsupportedStorage`.
pub async fn connect(uri: &str) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = if uri == "memory://" || uri.starts_with("memory://") {
        Arc::new(MemoryStorage::new())
    } else if let Some(scheme_end) = uri.find("://") {
        let scheme = &uri[..scheme_end];
        match scheme {
            "sqlite" => Arc::new(SqliteStorage::new(uri).await?),
            "postgres" | "postgresql" => Arc::new(PostgresStorage::new(uri).await?),
            "redis" | "rediss" => Arc::new(RedisStorage::new(uri)?),
            other => return Err(Error::UnsupportedStorage(other.to_string())),
        }
    } else {
        return Err(Error::UnsupportedStorage(uri.to_string()));
    };

    storage.connect().await?;
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_dispatches_memory_scheme() {
        let storage = connect("memory://").await.unwrap();
        storage.save_job(&Job::new("j".into(), "*/5 * * * * *".into(), JobOptions::default())).await.unwrap();
        assert!(storage.get_job("j").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        let err = connect("carrier-pigeon://nest").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedStorage(_)));
    }

    #[tokio::test]
    async fn connect_rejects_schemeless_uri() {
        let err = connect("not-a-uri").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedStorage(_)));
    }
}
