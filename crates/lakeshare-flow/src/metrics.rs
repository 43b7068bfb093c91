//! Metrics for the dispatcher, grant handler and admin bootstrap.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `lakeshare_dispatch_total` | Counter | `outcome` | Dispatcher invocations |
//! | `lakeshare_grant_total` | Counter | `outcome` | Grant handler invocations |
//! | `lakeshare_grant_step_seconds` | Histogram | `step` | Duration of each grant step |
//! | `lakeshare_grant_alerts_total` | Counter | - | Operator alerts raised by failing grants |
//! | `lakeshare_admin_reconcile_total` | Counter | `outcome` | Admin reconcile runs |
//!
//! Ledger metrics live in `lakeshare_ledger::metrics`. No exporter is
//! installed here; without a recorder every call is a no-op.

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names.
pub mod names {
    /// Counter: dispatcher invocations by outcome.
    pub const DISPATCH_TOTAL: &str = "lakeshare_dispatch_total";
    /// Counter: grant handler invocations by outcome.
    pub const GRANT_TOTAL: &str = "lakeshare_grant_total";
    /// Histogram: grant step duration in seconds.
    pub const GRANT_STEP_SECONDS: &str = "lakeshare_grant_step_seconds";
    /// Counter: operator alerts.
    pub const GRANT_ALERTS_TOTAL: &str = "lakeshare_grant_alerts_total";
    /// Counter: admin reconcile runs by outcome.
    pub const ADMIN_RECONCILE_TOTAL: &str = "lakeshare_admin_reconcile_total";
}

/// Label keys.
pub mod labels {
    /// Invocation outcome (published, ignored, unresolved, granted, failed, ...).
    pub const OUTCOME: &str = "outcome";
    /// Grant step name.
    pub const STEP: &str = "step";
}

/// Registers metric descriptions.
///
/// Call once at startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(names::DISPATCH_TOTAL, "Dispatcher invocations by outcome");
    describe_counter!(names::GRANT_TOTAL, "Grant handler invocations by outcome");
    describe_histogram!(names::GRANT_STEP_SECONDS, "Duration of each grant step");
    describe_counter!(
        names::GRANT_ALERTS_TOTAL,
        "Operator alerts raised by repeatedly failing or non-retryable grants"
    );
    describe_counter!(names::ADMIN_RECONCILE_TOTAL, "Admin reconcile runs by outcome");
    lakeshare_ledger::metrics::register_metrics();
}

/// Records a dispatcher outcome.
pub fn record_dispatch(outcome: &str) {
    counter!(names::DISPATCH_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
}

/// Records a grant handler outcome.
pub fn record_grant(outcome: &str) {
    counter!(names::GRANT_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
}

/// Records the duration of a grant step.
pub fn observe_grant_step(step: &str, duration: Duration) {
    histogram!(names::GRANT_STEP_SECONDS, labels::STEP => step.to_string())
        .record(duration.as_secs_f64());
}

/// Records an operator alert.
pub fn record_grant_alert() {
    counter!(names::GRANT_ALERTS_TOTAL).increment(1);
}

/// Records an admin reconcile outcome.
pub fn record_admin_reconcile(outcome: &str) {
    counter!(names::ADMIN_RECONCILE_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
}

/// RAII guard that records a grant step duration when dropped.
#[derive(Debug)]
pub struct StepTimer {
    step: &'static str,
    start: Instant,
}

impl StepTimer {
    /// Starts timing `step`.
    #[must_use]
    pub fn start(step: &'static str) -> Self {
        Self {
            step,
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        observe_grant_step(self.step, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        register_metrics();
        record_dispatch("published");
        record_grant("granted");
        record_grant_alert();
        record_admin_reconcile("unchanged");
        observe_grant_step("share", Duration::from_millis(5));
    }

    #[test]
    fn step_timer_measures() {
        let timer = StepTimer::start("materialize");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() >= Duration::from_millis(1));
    }
}
