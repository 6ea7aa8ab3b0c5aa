//! Metrics for step execution observability.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding binary.

use metrics::{counter, gauge, histogram};

use crate::results::ResultCode;

/// Record a step entering RUNNING.
pub fn step_started(step_name: &str) {
    counter!("ci_steps_started_total", "step" => step_name.to_string()).increment(1);
    gauge!("ci_steps_running").increment(1.0);
}

/// Record a step reaching FINISHED.
pub fn step_finished(result: ResultCode, was_running: bool) {
    counter!("ci_steps_finished_total", "result" => result.as_str()).increment(1);
    if was_running {
        gauge!("ci_steps_running").decrement(1.0);
    }
}

/// Record step duration.
pub fn step_duration(step_name: &str, duration_ms: u64) {
    histogram!("ci_step_duration_ms", "step" => step_name.to_string()).record(duration_ms as f64);
}

/// Record how long a step waited for its locks.
pub fn lock_wait(lock_name: &str, wait_ms: u64) {
    histogram!("ci_lock_wait_ms", "lock" => lock_name.to_string()).record(wait_ms as f64);
}

/// Record a remote command sent to a worker.
pub fn command_dispatched(command: &str) {
    counter!("ci_remote_commands_total", "command" => command.to_string()).increment(1);
}

/// Record a forced escalation of an interrupted command.
pub fn command_escalated(signal: &str) {
    counter!("ci_remote_command_escalations_total", "signal" => signal.to_string()).increment(1);
}

/// Record a batch of test results written to the store.
pub fn test_results_flushed(count: usize) {
    counter!("ci_test_results_flushed_total").increment(count as u64);
}

/// Record one debounced summary recomputation.
pub fn summary_recomputed() {
    counter!("ci_summary_recomputations_total").increment(1);
}

/// Record a build finishing.
pub fn build_finished(result: ResultCode, duration_ms: u64) {
    counter!("ci_builds_total", "result" => result.as_str()).increment(1);
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}
