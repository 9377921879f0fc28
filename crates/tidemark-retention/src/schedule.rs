//! Periodic snapshots of curated tables.
//!
//! Runs on its own interval, independent of the refresh scheduler. A failed
//! snapshot of one table is logged and does not stop the others.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::record::RetentionRecord;
use crate::store::RetentionStore;

/// Outcome of one pass over the snapshot tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotRun {
    /// Records written.
    pub taken: Vec<RetentionRecord>,
    /// Tables that could not be snapshotted, with the error.
    pub failed: Vec<(String, String)>,
}

/// Snapshots a fixed set of tables on a fixed interval.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    store: Arc<RetentionStore>,
    tables: Vec<String>,
    interval: Duration,
}

impl SnapshotSchedule {
    /// Default interval: daily.
    pub const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

    /// Creates a daily schedule for `tables`.
    #[must_use]
    pub fn new(store: Arc<RetentionStore>, tables: Vec<String>) -> Self {
        Self {
            store,
            tables,
            interval: Self::DAILY,
        }
    }

    /// Replaces the interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tables covered by this schedule.
    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Snapshots every table once.
    pub async fn run_once(&self) -> SnapshotRun {
        let mut run = SnapshotRun::default();
        for table in &self.tables {
            match self.store.snapshot(table).await {
                Ok(record) => run.taken.push(record),
                Err(e) => {
                    tracing::warn!(table = %table, error = %e, "scheduled snapshot failed");
                    run.failed.push((table.clone(), e.to_string()));
                }
            }
        }
        run
    }

    /// Snapshots on every interval until `shutdown` turns true.
    ///
    /// The first pass runs one interval after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    let run = self.run_once().await;
                    tracing::info!(
                        taken = run.taken.len(),
                        failed = run.failed.len(),
                        "snapshot pass finished"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("snapshot schedule stopped");
    }
}
