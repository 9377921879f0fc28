//! Metrics for change ingestion, refresh scheduling and compute spend.
//!
//! All metrics go through the `metrics` crate facade; installing a recorder
//! (Prometheus or otherwise) is left to the embedding binary.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tidemark_table_transitions_total` | Counter | `table`, `from_state`, `to_state` | Table status transitions |
//! | `tidemark_refresh_duration_seconds` | Histogram | `tier`, `reason`, `result` | Refresh wall time |
//! | `tidemark_dispatches_total` | Counter | `tier`, `result` | Dispatch decisions |
//! | `tidemark_tier_slots_in_use` | Gauge | `tier` | Reserved compute slots |
//! | `tidemark_scheduler_tick_duration_seconds` | Histogram | - | Tick processing time |
//! | `tidemark_change_events_total` | Counter | `table`, `result` | Appended or dropped change events |
//! | `tidemark_compute_cost_total` | Counter | `tier` | Cost of completed refreshes (milli-units) |
//! | `tidemark_cost_anomalies_total` | Counter | `tier` | Anomaly alerts raised |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: table status transitions.
    pub const TABLE_TRANSITIONS_TOTAL: &str = "tidemark_table_transitions_total";
    /// Histogram: refresh duration in seconds.
    pub const REFRESH_DURATION_SECONDS: &str = "tidemark_refresh_duration_seconds";
    /// Counter: dispatch decisions.
    pub const DISPATCHES_TOTAL: &str = "tidemark_dispatches_total";
    /// Gauge: compute slots currently reserved.
    pub const TIER_SLOTS_IN_USE: &str = "tidemark_tier_slots_in_use";
    /// Histogram: scheduler tick processing time in seconds.
    pub const SCHEDULER_TICK_DURATION_SECONDS: &str = "tidemark_scheduler_tick_duration_seconds";
    /// Counter: change events by append outcome.
    pub const CHANGE_EVENTS_TOTAL: &str = "tidemark_change_events_total";
    /// Counter: compute cost in thousandths of a cost unit.
    pub const COMPUTE_COST_TOTAL: &str = "tidemark_compute_cost_total";
    /// Counter: cost anomalies raised.
    pub const COST_ANOMALIES_TOTAL: &str = "tidemark_cost_anomalies_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Derived or source table name.
    pub const TABLE: &str = "table";
    /// Previous status (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target status (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Compute tier (bulk, incremental).
    pub const TIER: &str = "tier";
    /// Refresh reason.
    pub const REASON: &str = "reason";
    /// Result (ok, failed, cancelled, accepted, duplicate, capacity).
    pub const RESULT: &str = "result";
}

/// Cloneable handle for recording flow metrics.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a table status transition.
    pub fn record_transition(&self, table: &str, from_state: &str, to_state: &str) {
        counter!(
            names::TABLE_TRANSITIONS_TOTAL,
            labels::TABLE => table.to_string(),
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records how long a refresh ran and how it ended.
    pub fn observe_refresh(&self, tier: &str, reason: &str, result: &str, duration: Duration) {
        histogram!(
            names::REFRESH_DURATION_SECONDS,
            labels::TIER => tier.to_string(),
            labels::REASON => reason.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a dispatch decision.
    pub fn record_dispatch(&self, tier: &str, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::TIER => tier.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the reserved slot gauge for a tier.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_slots_in_use(&self, tier: &str, in_use: usize) {
        gauge!(names::TIER_SLOTS_IN_USE, labels::TIER => tier.to_string()).set(in_use as f64);
    }

    /// Records scheduler tick duration.
    pub fn observe_scheduler_tick_duration(&self, duration: Duration) {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records the outcome of appending a change event.
    pub fn record_change_event(&self, table: &str, result: &str) {
        counter!(
            names::CHANGE_EVENTS_TOTAL,
            labels::TABLE => table.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Adds the cost of a completed refresh.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn record_cost(&self, tier: &str, cost: f64) {
        let milli = (cost.max(0.0) * 1000.0).round() as u64;
        counter!(names::COMPUTE_COST_TOTAL, labels::TIER => tier.to_string()).increment(milli);
    }

    /// Records an anomaly alert.
    pub fn record_anomaly(&self, tier: &str) {
        counter!(names::COST_ANOMALIES_TOTAL, labels::TIER => tier.to_string()).increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for scheduler tick metrics.
#[must_use]
pub fn time_scheduler_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
