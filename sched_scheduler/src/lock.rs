//! ABOUTME: Wraps Storage's three lock calls with TTL defaults and periodic extension
//! ABOUTME: Atomicity lives in the backend (§4.2); this only owns extension-task bookkeeping (§4.3)

use sched_storage::Storage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default lease duration for an acquired lock (§4.3).
pub const DEFAULT_TTL: Duration = Duration::from_millis(60_000);

/// Default extension cadence — half the default TTL (§4.3).
pub const DEFAULT_EXTENSION_INTERVAL: Duration = Duration::from_millis(30_000);

/// A held lock plus the task that keeps it alive for as long as the
/// execution runs. One `LockManager` is instantiated per execution, per
/// §4.3 ("The Executor instantiates a Lock Manager per execution").
pub struct LockManager {
    storage: Arc<dyn Storage>,
    job_name: String,
    worker_id: String,
}

impl LockManager {
    pub fn new(storage: Arc<dyn Storage>, job_name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            storage,
            job_name: job_name.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Attempt to acquire with `ttl`. On success, spawns the periodic
    /// extension task and returns a guard that releases on `release()` (or,
    /// best-effort, on drop).
    pub async fn acquire(&self, ttl: Duration, extension_interval: Duration) -> sched_core::Result<Option<LockGuard>> {
        let acquired = self
            .storage
            .acquire_lock(&self.job_name, &self.worker_id, ttl)
            .await?;

        if !acquired {
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        let lost_ownership = Arc::new(AtomicBool::new(false));

        let extension_task = {
            let storage = self.storage.clone();
            let job_name = self.job_name.clone();
            let worker_id = self.worker_id.clone();
            let cancel = cancel.clone();
            let lost_ownership = lost_ownership.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(extension_interval);
                interval.tick().await; // first tick fires immediately; skip it

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            match storage.extend_lock(&job_name, &worker_id, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    // Ownership lost to a contender that took over an
                                    // expired lease. §4.3: log and keep running — the
                                    // in-flight handler is not cancelled.
                                    warn!(job_name, worker_id, "lock extension lost ownership");
                                    lost_ownership.store(true, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    warn!(job_name, worker_id, error = %e, "lock extension failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        Ok(Some(LockGuard {
            storage: self.storage.clone(),
            job_name: self.job_name.clone(),
            worker_id: self.worker_id.clone(),
            cancel,
            extension_task: Some(extension_task),
            lost_ownership,
        }))
    }
}

/// RAII handle for a held lock. `release()` stops extension and deletes the
/// record; dropping without calling it still stops extension and spawns a
/// best-effort async release, mirroring the corpus's `LockGuard` idiom.
pub struct LockGuard {
    storage: Arc<dyn Storage>,
    job_name: String,
    worker_id: String,
    cancel: CancellationToken,
    extension_task: Option<tokio::task::JoinHandle<()>>,
    lost_ownership: Arc<AtomicBool>,
}

impl LockGuard {
    /// Whether a periodic extension observed that another worker has taken
    /// over the lease. Surfaced for callers that want to react (§9 open
    /// question: this spec keeps the default logged-warning behavior).
    pub fn lost_ownership(&self) -> bool {
        self.lost_ownership.load(Ordering::Relaxed)
    }

    pub async fn release(mut self) -> sched_core::Result<bool> {
        self.cancel.cancel();
        if let Some(task) = self.extension_task.take() {
            let _ = task.await;
        }
        self.storage.release_lock(&self.job_name, &self.worker_id).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        let storage = self.storage.clone();
        let job_name = self.job_name.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.release_lock(&job_name, &worker_id).await {
                warn!(job_name, worker_id, error = %e, "failed to release lock on drop");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sched_storage::memory::MemoryStorage;

    #[tokio::test]
    async fn acquire_then_release_allows_a_second_worker_in() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let m1 = LockManager::new(storage.clone(), "j", "w1");
        let guard = m1
            .acquire(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap()
            .expect("first acquire should succeed");

        let m2 = LockManager::new(storage.clone(), "j", "w2");
        assert!(m2
            .acquire(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        assert!(guard.release().await.unwrap());

        assert!(m2
            .acquire(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn extension_task_keeps_lease_alive_past_original_ttl() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let m1 = LockManager::new(storage.clone(), "j", "w1");
        let _guard = m1
            .acquire(Duration::from_millis(120), Duration::from_millis(40))
            .await
            .unwrap()
            .expect("acquire should succeed");

        tokio::time::sleep(Duration::from_millis(200)).await;

        let m2 = LockManager::new(storage.clone(), "j", "w2");
        assert!(
            m2.acquire(Duration::from_millis(120), Duration::from_millis(40))
                .await
                .unwrap()
                .is_none(),
            "extension should have kept the lease alive past its original ttl"
        );
    }
}
