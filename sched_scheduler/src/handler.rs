//! ABOUTME: The in-process job handler contract and its execution context
//! ABOUTME: Handlers are never persisted — they live only in the registering worker (§9)

use async_trait::async_trait;
use sched_core::{Id, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler needs for one attempt: identity, the attempt
/// number, and a cooperative cancellation signal.
///
/// # Cancellation
///
/// Handlers SHOULD check `context.cancellation_token.is_cancelled()` or
/// race `context.cancellation_token.cancelled()` via `tokio::select!` so a
/// timed-out attempt can wind down promptly. The executor does not forcibly
/// kill handler futures — see §4.5's timeout semantics.
#[derive(Clone)]
pub struct JobContext {
    pub run_id: Id,
    pub job_name: String,
    pub attempt: u32,
    pub metadata: HashMap<String, String>,
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(run_id: Id, job_name: String, attempt: u32) -> Self {
        Self {
            run_id,
            job_name,
            attempt,
            metadata: HashMap::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// A registered job's executable body. Implementations hold whatever state
/// the handler closes over (database pools, clients); the scheduler holds
/// only `Arc<dyn JobHandler>`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, context: JobContext) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn execute(&self, context: JobContext) -> Result<serde_json::Value> {
        (self)(context).await
    }
}

/// Callback invoked after a successful attempt. Failures inside the
/// callback are logged and never propagated (§4.5c).
pub type SuccessCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Callback invoked after a failed attempt. Same failure-swallowing policy
/// as `SuccessCallback`.
pub type ErrorCallback = Arc<dyn Fn(&sched_core::Error) + Send + Sync>;

/// Everything a worker registers alongside a handler at `schedule()` time
/// that is NOT part of the persisted `Job` record (§3: "Callbacks are NOT
/// persisted — they live only in the registering worker's process").
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn fire_success(&self, value: &serde_json::Value) {
        if let Some(cb) = &self.on_success {
            cb(value);
        }
    }

    pub fn fire_error(&self, err: &sched_core::Error) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}
