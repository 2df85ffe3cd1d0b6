//! ABOUTME: Core types, errors, clock/cron utilities shared by the scheduler workspace
//! ABOUTME: Foundation crate consumed by sched_storage and sched_scheduler

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod telemetry;

pub use backoff::{Backoff, BackoffKind};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use id::Id;
