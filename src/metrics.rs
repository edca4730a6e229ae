//! Metric emission
//!
//! Thin helpers over the `metrics` facade so handler code stays readable.
//! Per-task-type: requests, latency, failures. Per-timeout-kind: timeout
//! counters. Global: stale mutable state refreshes.

use crate::task::TimeoutKind;
use std::time::Duration;

pub const TIMER_TASK_REQUESTS: &str = "timer_task_requests_total";
pub const TIMER_TASK_FAILURES: &str = "timer_task_failures_total";
pub const TIMER_TASK_LATENCY: &str = "timer_task_latency_seconds";
pub const TIMER_TIMEOUT: &str = "timer_timeout_total";
pub const STALE_MUTABLE_STATE: &str = "stale_mutable_state_total";

pub(crate) fn record_task_request(operation: &'static str) {
    metrics::counter!(TIMER_TASK_REQUESTS, "operation" => operation).increment(1);
}

pub(crate) fn record_task_failure(operation: &'static str) {
    metrics::counter!(TIMER_TASK_FAILURES, "operation" => operation).increment(1);
}

pub(crate) fn record_task_latency(operation: &'static str, elapsed: Duration) {
    metrics::histogram!(TIMER_TASK_LATENCY, "operation" => operation).record(elapsed.as_secs_f64());
}

pub(crate) fn record_timeout(kind: TimeoutKind) {
    metrics::counter!(TIMER_TIMEOUT, "kind" => kind.as_str()).increment(1);
}

pub(crate) fn record_stale_mutable_state() {
    metrics::counter!(STALE_MUTABLE_STATE).increment(1);
}
