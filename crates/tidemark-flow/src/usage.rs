//! Compute usage accounting and cost anomaly detection.
//!
//! Every completed refresh produces a [`UsageSample`]. The monitor keeps the
//! samples, summarizes spend per tier and day, and flags a tier whose rolling
//! window cost exceeds its learned baseline by a configured factor.
//!
//! The monitor is advisory. It never touches the scheduler or in-flight
//! refreshes; anomalies only leave through an [`AlertSink`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::TaskId;

use crate::alert::{Alert, AlertSink};
use crate::error::Result;
use crate::metrics::FlowMetrics;
use crate::state::RefreshReason;
use crate::tier::{ComputeTier, TierProfile};

/// Compute consumed by one refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Refresh task.
    pub task_id: TaskId,
    /// Refreshed table.
    pub table: String,
    /// Tier the refresh ran on.
    pub tier: ComputeTier,
    /// Why it ran.
    pub reason: RefreshReason,
    /// Start of execution.
    pub started_at: DateTime<Utc>,
    /// End of execution.
    pub finished_at: DateTime<Utc>,
    /// Compute units billed.
    pub compute_units: f64,
    /// Cost of the units.
    pub cost: f64,
}

impl UsageSample {
    /// Prices a refresh on `profile`: units are wall hours times the tier's
    /// units per hour.
    #[must_use]
    pub fn priced(
        task_id: TaskId,
        table: impl Into<String>,
        tier: ComputeTier,
        reason: RefreshReason,
        profile: &TierProfile,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let hours = finished_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as f64
            / 3_600_000.0;
        let compute_units = hours * profile.units_per_hour;
        Self {
            task_id,
            table: table.into(),
            tier,
            reason,
            started_at,
            finished_at,
            compute_units,
            cost: compute_units * profile.cost_per_unit,
        }
    }
}

/// A tier whose rolling cost broke away from its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Affected tier.
    pub tier: ComputeTier,
    /// Start of the evaluated window.
    pub window_start: DateTime<Utc>,
    /// End of the evaluated window.
    pub window_end: DateTime<Utc>,
    /// Cost inside the window.
    pub window_cost: f64,
    /// Mean cost of the baseline windows.
    pub baseline_mean: f64,
    /// `window_cost / baseline_mean`.
    pub ratio: f64,
    /// Standard score against the baseline; 0 when the baseline has no variance.
    pub z_score: f64,
}

/// Anomaly detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Alert when window cost exceeds `factor * baseline_mean`.
    pub factor: f64,
    /// Length of the rolling window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Number of preceding windows forming the baseline.
    pub baseline_windows: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            factor: 2.0,
            window: Duration::from_secs(24 * 60 * 60),
            baseline_windows: 30,
        }
    }
}

/// Spend of one tier on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTierCost {
    /// UTC day.
    pub day: NaiveDate,
    /// Tier.
    pub tier: ComputeTier,
    /// Units billed.
    pub compute_units: f64,
    /// Cost.
    pub cost: f64,
    /// Refreshes counted.
    pub tasks: usize,
}

/// Spend across tiers on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    /// UTC day.
    pub day: NaiveDate,
    /// Units billed.
    pub compute_units: f64,
    /// Cost.
    pub cost: f64,
    /// Tiers with at least one refresh.
    pub tiers: Vec<ComputeTier>,
    /// Refreshes counted.
    pub tasks: usize,
}

/// Append-only usage log with cost summaries and anomaly detection.
#[derive(Debug, Default)]
pub struct UsageMonitor {
    samples: Mutex<Vec<UsageSample>>,
    config: AnomalyConfig,
    metrics: FlowMetrics,
}

impl UsageMonitor {
    /// Creates a monitor with default anomaly settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a monitor with custom anomaly settings.
    #[must_use]
    pub fn with_config(config: AnomalyConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    fn samples(&self) -> std::sync::MutexGuard<'_, Vec<UsageSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a sample.
    pub fn record(&self, sample: UsageSample) {
        self.metrics.record_cost(sample.tier.as_str(), sample.cost);
        self.samples().push(sample);
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples().is_empty()
    }

    /// Drops samples that finished before `cutoff`. Returns how many.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut samples = self.samples();
        let before = samples.len();
        samples.retain(|s| s.finished_at >= cutoff);
        before - samples.len()
    }

    /// Checks every tier's window ending at `now` against its baseline.
    ///
    /// The baseline is the mean of the preceding windows, counting only
    /// windows since usage was first recorded. Tiers without baseline
    /// history, or with a zero baseline, are not evaluated.
    pub fn evaluate(&self, now: DateTime<Utc>) -> impl Iterator<Item = AnomalyAlert> + use<> {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let samples = self.samples();
        let mut alerts = Vec::new();

        for tier in ComputeTier::ALL {
            let tier_samples: Vec<&UsageSample> =
                samples.iter().filter(|s| s.tier == tier).collect();
            let Some(first) = tier_samples.iter().map(|s| s.finished_at).min() else {
                continue;
            };
            let cost_between = |start: DateTime<Utc>, end: DateTime<Utc>| -> f64 {
                tier_samples
                    .iter()
                    .filter(|s| s.finished_at >= start && s.finished_at < end)
                    .map(|s| s.cost)
                    .sum()
            };

            let window_start = now - window;
            let window_cost = cost_between(window_start, now);

            let baseline: Vec<f64> = (1..=self.config.baseline_windows)
                .map(|k| {
                    let end = now - window * i32::try_from(k).unwrap_or(i32::MAX);
                    (end - window, end)
                })
                .take_while(|(_, end)| *end > first)
                .map(|(start, end)| cost_between(start, end))
                .collect();
            if baseline.is_empty() {
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let n = baseline.len() as f64;
            let mean = baseline.iter().sum::<f64>() / n;
            if mean <= 0.0 || window_cost <= self.config.factor * mean {
                continue;
            }
            let variance = baseline.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();
            let z_score = if std_dev > 0.0 {
                (window_cost - mean) / std_dev
            } else {
                0.0
            };

            alerts.push(AnomalyAlert {
                tier,
                window_start,
                window_end: now,
                window_cost,
                baseline_mean: mean,
                ratio: window_cost / mean,
                z_score,
            });
        }

        alerts.into_iter()
    }

    /// Evaluates at `now` and forwards every anomaly to `sink`.
    ///
    /// Returns the number of alerts sent.
    ///
    /// # Errors
    ///
    /// Returns the first delivery error.
    pub async fn notify(&self, now: DateTime<Utc>, sink: &dyn AlertSink) -> Result<usize> {
        let mut sent = 0;
        for anomaly in self.evaluate(now) {
            self.metrics.record_anomaly(anomaly.tier.as_str());
            tracing::warn!(
                tier = %anomaly.tier,
                window_cost = anomaly.window_cost,
                baseline_mean = anomaly.baseline_mean,
                "compute cost anomaly detected"
            );
            sink.send(&Alert::cost_anomaly(anomaly, now)).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Spend per tier per UTC day over the `days` days ending today.
    ///
    /// Sorted by day, then tier. Tiers without refreshes on a day are omitted.
    #[must_use]
    pub fn cost_by_tier_per_day(&self, days: u32, now: DateTime<Utc>) -> Vec<DailyTierCost> {
        let today = now.date_naive();
        let first_day = today - chrono::Duration::days(i64::from(days.saturating_sub(1)));
        let mut totals: BTreeMap<(NaiveDate, ComputeTier), (f64, f64, usize)> = BTreeMap::new();

        for sample in self.samples().iter() {
            let day = sample.finished_at.date_naive();
            if days == 0 || day < first_day || day > today {
                continue;
            }
            let entry = totals.entry((day, sample.tier)).or_default();
            entry.0 += sample.compute_units;
            entry.1 += sample.cost;
            entry.2 += 1;
        }

        totals
            .into_iter()
            .map(|((day, tier), (compute_units, cost, tasks))| DailyTierCost {
                day,
                tier,
                compute_units,
                cost,
                tasks,
            })
            .collect()
    }

    /// Spend across tiers on `day`.
    #[must_use]
    pub fn daily_summary(&self, day: NaiveDate) -> DailySummary {
        let mut summary = DailySummary {
            day,
            compute_units: 0.0,
            cost: 0.0,
            tiers: Vec::new(),
            tasks: 0,
        };
        let mut tiers = BTreeSet::new();
        for sample in self.samples().iter().filter(|s| s.finished_at.date_naive() == day) {
            summary.compute_units += sample.compute_units;
            summary.cost += sample.cost;
            summary.tasks += 1;
            tiers.insert(sample.tier);
        }
        summary.tiers = tiers.into_iter().collect();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::alert::{AlertKind, InMemoryAlertSink};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn sample(tier: ComputeTier, finished_at: DateTime<Utc>, cost: f64) -> UsageSample {
        UsageSample {
            task_id: TaskId::generate(),
            table: "clean".into(),
            tier,
            reason: RefreshReason::Incremental,
            started_at: finished_at,
            finished_at,
            compute_units: cost / 3.0,
            cost,
        }
    }

    #[test]
    fn pricing_uses_wall_hours_and_unit_price() {
        let profile = TierProfile::default_for(ComputeTier::Bulk);
        let s = UsageSample::priced(
            TaskId::generate(),
            "clean",
            ComputeTier::Bulk,
            RefreshReason::InitialBackfill,
            &profile,
            t0(),
            t0() + chrono::Duration::minutes(30),
        );
        assert!((s.compute_units - 8.0).abs() < 1e-9);
        assert!((s.cost - 24.0).abs() < 1e-9);
    }

    #[test]
    fn steady_spend_raises_nothing() {
        let monitor = UsageMonitor::new();
        for day in 0..10 {
            monitor.record(sample(
                ComputeTier::Incremental,
                t0() - chrono::Duration::days(day) - chrono::Duration::hours(1),
                3.0,
            ));
        }
        assert_eq!(monitor.evaluate(t0()).count(), 0);
    }

    #[test]
    fn spike_over_factor_is_flagged_with_detail() {
        let monitor = UsageMonitor::new();
        for day in 1..=5 {
            monitor.record(sample(
                ComputeTier::Incremental,
                t0() - chrono::Duration::days(day) - chrono::Duration::hours(1),
                3.0,
            ));
        }
        monitor.record(sample(
            ComputeTier::Incremental,
            t0() - chrono::Duration::hours(2),
            9.0,
        ));

        let alerts: Vec<_> = monitor.evaluate(t0()).collect();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.tier, ComputeTier::Incremental);
        assert!((alert.baseline_mean - 3.0).abs() < 1e-9);
        assert!((alert.ratio - 3.0).abs() < 1e-9);
        assert!(alert.z_score.abs() < f64::EPSILON);
    }

    #[test]
    fn no_history_means_no_baseline() {
        let monitor = UsageMonitor::new();
        monitor.record(sample(ComputeTier::Bulk, t0() - chrono::Duration::hours(1), 48.0));
        assert_eq!(monitor.evaluate(t0()).count(), 0);
    }

    #[tokio::test]
    async fn notify_forwards_anomalies() {
        let monitor = UsageMonitor::new();
        monitor.record(sample(
            ComputeTier::Bulk,
            t0() - chrono::Duration::days(1) - chrono::Duration::hours(1),
            10.0,
        ));
        monitor.record(sample(ComputeTier::Bulk, t0() - chrono::Duration::hours(1), 50.0));

        let sink = InMemoryAlertSink::new();
        assert_eq!(monitor.notify(t0(), &sink).await.unwrap(), 1);
        let alerts = sink.alerts();
        assert!(matches!(
            &alerts[0].kind,
            AlertKind::CostAnomaly(a) if a.tier == ComputeTier::Bulk
        ));
    }

    #[test]
    fn summaries_group_by_day_and_tier() {
        let monitor = UsageMonitor::new();
        monitor.record(sample(ComputeTier::Bulk, t0(), 48.0));
        monitor.record(sample(ComputeTier::Incremental, t0(), 1.5));
        monitor.record(sample(ComputeTier::Incremental, t0(), 1.5));
        monitor.record(sample(
            ComputeTier::Incremental,
            t0() - chrono::Duration::days(1),
            3.0,
        ));

        let per_day = monitor.cost_by_tier_per_day(2, t0());
        assert_eq!(per_day.len(), 3);
        assert_eq!(per_day[0].day, (t0() - chrono::Duration::days(1)).date_naive());
        assert_eq!(per_day[2].tier, ComputeTier::Incremental);
        assert_eq!(per_day[2].tasks, 2);
        assert!(monitor.cost_by_tier_per_day(0, t0()).is_empty());

        let summary = monitor.daily_summary(t0().date_naive());
        assert_eq!(summary.tasks, 3);
        assert!((summary.cost - 51.0).abs() < 1e-9);
        assert_eq!(summary.tiers, [ComputeTier::Bulk, ComputeTier::Incremental]);
    }
}
