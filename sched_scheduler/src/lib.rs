//! ABOUTME: Scheduling, execution, and coordination on top of sched_storage
//! ABOUTME: Clock/cron math and Storage backends live in sched_core/sched_storage; this crate is the runtime

pub mod coordinator;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod metrics;
pub mod scheduler;

pub use coordinator::{Coordinator, ScheduleOptions};
pub use executor::Executor;
pub use handler::{Callbacks, ErrorCallback, JobContext, JobHandler, SuccessCallback};
pub use lock::{LockGuard, LockManager, DEFAULT_EXTENSION_INTERVAL, DEFAULT_TTL};
pub use metrics::{MetricsSink, NoopMetricsSink, TracingMetricsSink};
pub use scheduler::Scheduler;
