//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common test fixtures used across the scheduler workspace

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A monotonically-increasing job name unique to the test process, so
/// concurrent tests against a shared storage backend never collide.
pub fn unique_job_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, std::process::id(), n)
}

/// Helper for creating temporary file-backed storage in tests.
pub fn temp_dir_path() -> std::path::PathBuf {
    std::env::temp_dir().join("sched-scheduler-test")
}

/// A sqlite database file path unique to this test, under `temp_dir_path()`.
pub fn temp_sqlite_path(prefix: &str) -> std::path::PathBuf {
    temp_dir_path().join(format!("{}.db", unique_job_name(prefix)))
}
