//! ABOUTME: The external metrics sink contract (§6) and two stock implementations
//! ABOUTME: A no-op sink is always acceptable; a tracing-backed sink logs samples at debug level

/// Five recording methods plus a queue-depth gauge and a snapshot hook.
/// Consumed by the Executor; never required to be anything more than a
/// no-op (§6: "A no-op implementation MUST be acceptable").
pub trait MetricsSink: Send + Sync {
    fn record_job_scheduled(&self, job_name: &str, worker_id: &str);
    fn record_job_started(&self, job_name: &str, worker_id: &str);
    fn record_job_completed(&self, job_name: &str, worker_id: &str, duration_seconds: f64);
    fn record_job_failed(&self, job_name: &str, worker_id: &str, duration_seconds: f64, error_kind: &str);
    fn update_queue_size(&self, worker_id: &str, n: u64);
    fn snapshot(&self) -> String;
}

/// Discards every sample. The default sink for a Coordinator that doesn't
/// care about observability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_job_scheduled(&self, _job_name: &str, _worker_id: &str) {}
    fn record_job_started(&self, _job_name: &str, _worker_id: &str) {}
    fn record_job_completed(&self, _job_name: &str, _worker_id: &str, _duration_seconds: f64) {}
    fn record_job_failed(&self, _job_name: &str, _worker_id: &str, _duration_seconds: f64, _error_kind: &str) {}
    fn update_queue_size(&self, _worker_id: &str, _n: u64) {}
    fn snapshot(&self) -> String {
        "{}".to_string()
    }
}

/// Logs every sample through `tracing` at `debug` level. Useful during
/// development without wiring an external metrics backend (§6.1), and a
/// lighter-weight alternative to the `AtomicU64` counter struct this sink
/// generalizes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_job_scheduled(&self, job_name: &str, worker_id: &str) {
        tracing::debug!(job_name, worker_id, "job scheduled");
    }

    fn record_job_started(&self, job_name: &str, worker_id: &str) {
        tracing::debug!(job_name, worker_id, "job started");
    }

    fn record_job_completed(&self, job_name: &str, worker_id: &str, duration_seconds: f64) {
        tracing::debug!(job_name, worker_id, duration_seconds, "job completed");
    }

    fn record_job_failed(&self, job_name: &str, worker_id: &str, duration_seconds: f64, error_kind: &str) {
        tracing::debug!(job_name, worker_id, duration_seconds, error_kind, "job failed");
    }

    fn update_queue_size(&self, worker_id: &str, n: u64) {
        tracing::debug!(worker_id, queue_size = n, "queue size updated");
    }

    fn snapshot(&self) -> String {
        "{}".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_every_call() {
        let sink = NoopMetricsSink;
        sink.record_job_scheduled("j", "w1");
        sink.record_job_started("j", "w1");
        sink.record_job_completed("j", "w1", 1.5);
        sink.record_job_failed("j", "w1", 1.5, "timeout");
        sink.update_queue_size("w1", 3);
        assert_eq!(sink.snapshot(), "{}");
    }

    #[test]
    fn tracing_sink_accepts_every_call() {
        let sink = TracingMetricsSink;
        sink.record_job_scheduled("j", "w1");
        sink.record_job_completed("j", "w1", 0.2);
        assert_eq!(sink.snapshot(), "{}");
    }
}
