//! Tidemark refresh scheduler service.
//!
//! Wires the change stream, materializer, scheduler, usage monitor and
//! retention snapshots from `TIDEMARK_*` configuration and runs them until
//! Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use tidemark_core::{FileBackend, StorageBackend, SystemClock, init_logging};
use tidemark_flow::alert::{AlertSink, LedgerAlertSink};
use tidemark_flow::config::{PipelineConfig, ServiceConfig};
use tidemark_flow::error::{Error, Result};
use tidemark_flow::scheduler::{Scheduler, SchedulerDeps};
use tidemark_flow::source::InMemorySource;
use tidemark_flow::store::{ObjectStateStore, StateStore};
use tidemark_flow::stream::{ChangeEvent, StreamHub};
use tidemark_flow::transform::TransformCatalog;
use tidemark_flow::usage::UsageMonitor;
use tidemark_retention::{RetentionStore, SnapshotSchedule, SnapshotSource};

/// How often cost anomalies are evaluated.
const ANOMALY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Usage samples older than this are dropped.
const USAGE_RETENTION_DAYS: i64 = 90;

async fn replay_feed(path: &Path, source: &InMemorySource) -> Result<usize> {
    let feed = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::configuration(format!("failed to read {}: {e}", path.display())))?;

    let mut accepted = 0;
    for (line_no, line) in feed.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ChangeEvent = serde_json::from_str(line).map_err(|e| {
            Error::serialization(format!("{}:{}: {e}", path.display(), line_no + 1))
        })?;
        match source.apply(event) {
            Ok(tidemark_flow::stream::AppendOutcome::Accepted) => accepted += 1,
            Ok(tidemark_flow::stream::AppendOutcome::Duplicate) => {}
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "change event rejected");
            }
        }
    }
    Ok(accepted)
}

async fn watch_usage(
    usage: Arc<UsageMonitor>,
    alerts: Arc<dyn AlertSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(ANOMALY_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                match usage.notify(now, alerts.as_ref()).await {
                    Ok(0) => {}
                    Ok(raised) => tracing::warn!(raised, "cost anomalies raised"),
                    Err(e) => tracing::error!(error = %e, "anomaly evaluation failed"),
                }
                let pruned = usage.prune_before(now - chrono::Duration::days(USAGE_RETENTION_DAYS));
                if pruned > 0 {
                    tracing::debug!(pruned, "old usage samples dropped");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env()?;
    init_logging(config.log_format);

    let pipeline = PipelineConfig::load(&config.pipeline_config).await?;
    let registry = pipeline.registry(&TransformCatalog::new())?;
    let mut tiers = pipeline.tiers.clone();
    config.apply_tier_overrides(&mut tiers);

    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(&config.data_dir));
    let store: Arc<dyn StateStore> = Arc::new(ObjectStateStore::new(Arc::clone(&backend)));
    let hub = Arc::new(StreamHub::new());
    let source = Arc::new(InMemorySource::new(Arc::clone(&hub)));
    for table in registry.sources() {
        source.register(table)?;
    }
    if let Some(feed) = &config.feed_path {
        let accepted = replay_feed(feed, &source).await?;
        tracing::info!(path = %feed.display(), accepted, "change feed replayed");
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(LedgerAlertSink::new(Arc::clone(&backend)));
    let usage = Arc::new(UsageMonitor::with_config(pipeline.anomaly.clone()));
    let deps = SchedulerDeps::new(registry, store, hub, source)
        .with_tiers(tiers)
        .with_clock(Arc::new(SystemClock))
        .with_alerts(Arc::clone(&alerts))
        .with_usage(Arc::clone(&usage));
    let scheduler = Arc::new(Scheduler::open(deps).await?);

    let published: Arc<dyn SnapshotSource> = scheduler.published().clone();
    let retention = RetentionStore::open(
        Arc::clone(&backend),
        published,
        config.writer_identity.clone(),
    )
    .await
    .map_err(|e| Error::storage(format!("failed to open retention store: {e}")))?;
    let snapshots = SnapshotSchedule::new(Arc::new(retention), pipeline.snapshot_tables.clone())
        .with_interval(config.snapshot_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        let tick_interval = config.tick_interval;
        tokio::spawn(async move { scheduler.run(tick_interval, shutdown).await })
    };
    let snapshot_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { snapshots.run(shutdown).await })
    };
    let usage_task = tokio::spawn(watch_usage(usage, alerts, shutdown_rx));

    tracing::info!(
        data_dir = %config.data_dir.display(),
        tick_interval = ?config.tick_interval,
        "tidemark scheduler started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::configuration(format!("failed to listen for shutdown signal: {e}")))?;
    tracing::info!("shutdown requested");
    // Receivers outlive the send; a failure only means every task already stopped.
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("scheduler", scheduler_task),
        ("snapshots", snapshot_task),
        ("usage", usage_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "task stopped abnormally");
        }
    }

    for status in scheduler.table_statuses().await {
        tracing::info!(
            table = %status.table,
            status = %status.status,
            version = status.published_version,
            "final table status"
        );
    }
    Ok(())
}
