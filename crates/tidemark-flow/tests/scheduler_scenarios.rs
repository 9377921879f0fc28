//! End-to-end scheduling scenarios: staleness, dependencies, tiers,
//! failures, retries, operator controls and restart recovery.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use tidemark_core::{Clock, ManualClock, MemoryBackend, StorageBackend};
use tidemark_flow::alert::{AlertKind, InMemoryAlertSink};
use tidemark_flow::error::Error;
use tidemark_flow::registry::{DerivedTableSpec, TableRegistry};
use tidemark_flow::row::{Row, row_of};
use tidemark_flow::scheduler::{RefreshOutcome, Scheduler, SchedulerDeps, TickReport};
use tidemark_flow::source::InMemorySource;
use tidemark_flow::state::{Backoff, RefreshReason, TableStatus};
use tidemark_flow::store::{ObjectStateStore, StateStore};
use tidemark_flow::stream::{AppendOutcome, ChangeEvent, Operation, StreamHub};
use tidemark_flow::tier::{ComputeTier, TierProfiles};
use tidemark_flow::transform::{Transform, TransformCatalog, TransformFailure, TransformSpec};
use tidemark_flow::usage::UsageMonitor;

const MIN: Duration = Duration::from_secs(60);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
}

/// Rejects rows with a negative amount.
#[derive(Debug)]
struct NonNegative;

impl Transform for NonNegative {
    fn apply(&self, _upstream: &str, row: &Row) -> Result<Option<Row>, TransformFailure> {
        match row.get("amount").and_then(serde_json::Value::as_i64) {
            Some(amount) if amount < 0 => Err(TransformFailure::new(format!(
                "negative amount {amount}"
            ))),
            _ => Ok(Some(row.clone())),
        }
    }
}

fn catalog() -> TransformCatalog {
    TransformCatalog::new().with("non_negative", Arc::new(NonNegative))
}

fn registry(derived: &[DerivedTableSpec]) -> TableRegistry {
    TableRegistry::build(&["orders".to_string()], derived, &catalog()).unwrap()
}

struct Pipeline {
    clock: Arc<ManualClock>,
    backend: Arc<MemoryBackend>,
    source: Arc<InMemorySource>,
    alerts: InMemoryAlertSink,
    usage: Arc<UsageMonitor>,
    scheduler: Scheduler,
}

impl Pipeline {
    async fn open(derived: &[DerivedTableSpec], tiers: TierProfiles) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        Self::open_on(derived, tiers, clock, backend, &[]).await
    }

    async fn open_on(
        derived: &[DerivedTableSpec],
        tiers: TierProfiles,
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
        replay: &[ChangeEvent],
    ) -> Self {
        let hub = Arc::new(StreamHub::new());
        let source = Arc::new(InMemorySource::new(hub.clone()));
        source.register("orders").unwrap();
        for event in replay {
            source.apply(event.clone()).unwrap();
        }
        let alerts = InMemoryAlertSink::new();
        let usage = Arc::new(UsageMonitor::new());
        let store = Arc::new(ObjectStateStore::new(backend.clone()));
        let deps = SchedulerDeps::new(registry(derived), store, hub, source.clone())
            .with_tiers(tiers)
            .with_clock(clock.clone())
            .with_alerts(Arc::new(alerts.clone()))
            .with_usage(usage.clone());
        let scheduler = Scheduler::open(deps).await.unwrap();
        Self {
            clock,
            backend,
            source,
            alerts,
            usage,
            scheduler,
        }
    }

    fn order(&self, op: Operation, pk: &str, amount: i64) -> u64 {
        let payload = if op == Operation::Delete {
            Row::new()
        } else {
            row_of([("id", json!(pk)), ("amount", json!(amount))])
        };
        self.source.commit("orders", op, pk, payload).unwrap()
    }

    /// Ticks and settles until nothing more happens.
    async fn converge(&self) -> Vec<TickReport> {
        let mut reports = Vec::new();
        for _ in 0..10 {
            let report = self.scheduler.tick().await.unwrap();
            let idle = report.dispatched.is_empty() && report.completed.is_empty();
            reports.push(report);
            self.scheduler.settle().await;
            if idle {
                return reports;
            }
        }
        panic!("pipeline did not converge");
    }

    async fn status(&self, table: &str) -> TableStatus {
        self.scheduler.status(table).await.unwrap()
    }

    async fn amount(&self, table: &str, pk: &str) -> Option<i64> {
        let view = self.scheduler.read(table).await?;
        view.table.get(pk).and_then(|r| r["amount"].as_i64())
    }
}

fn clean(lag: Duration) -> DerivedTableSpec {
    DerivedTableSpec::new("clean_orders", &["orders"], lag)
}

fn revenue(lag: Duration) -> DerivedTableSpec {
    DerivedTableSpec::new("daily_revenue", &["clean_orders"], lag)
}

#[tokio::test]
async fn insert_update_delete_backfill_leaves_no_row_and_ignores_redelivery() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.order(Operation::Update, "1", 20);
    p.order(Operation::Delete, "1", 0);

    let first = p.scheduler.tick().await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    assert_eq!(first.dispatched[0].reason, RefreshReason::InitialBackfill);
    assert_eq!(first.dispatched[0].tier, ComputeTier::Bulk);
    p.scheduler.settle().await;

    assert_eq!(p.status("clean_orders").await, TableStatus::Fresh);
    assert_eq!(p.amount("clean_orders", "1").await, None);

    let redelivered = ChangeEvent::update(
        "orders",
        "1",
        2,
        row_of([("id", json!("1")), ("amount", json!(20))]),
    );
    assert_eq!(p.source.apply(redelivered).unwrap(), AppendOutcome::Duplicate);
    p.converge().await;
    assert_eq!(p.amount("clean_orders", "1").await, None);
}

#[tokio::test]
async fn target_lag_alone_marks_a_table_stale() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;
    let before = p.scheduler.state("clean_orders").await.unwrap();
    assert_eq!(before.last_refresh_completed_at, Some(t0()));

    p.clock.advance(chrono::Duration::minutes(4));
    let report = p.scheduler.tick().await.unwrap();
    assert!(report.marked_stale.is_empty());
    assert_eq!(p.status("clean_orders").await, TableStatus::Fresh);

    p.clock.advance(chrono::Duration::minutes(2));
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.marked_stale, vec!["clean_orders"]);
    assert_eq!(report.dispatched[0].reason, RefreshReason::Incremental);
    assert_eq!(report.dispatched[0].tier, ComputeTier::Incremental);
    p.scheduler.settle().await;

    let after = p.scheduler.state("clean_orders").await.unwrap();
    assert_eq!(after.status, TableStatus::Fresh);
    assert_eq!(after.published_version, before.published_version);
    assert_eq!(after.watermarks, before.watermarks);
    assert_eq!(
        after.last_refresh_completed_at,
        Some(t0() + chrono::Duration::minutes(6))
    );
}

#[tokio::test]
async fn upstream_changes_propagate_staleness() {
    let p = Pipeline::open(&[clean(60 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;

    p.order(Operation::Update, "1", 15);
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.marked_stale, vec!["clean_orders"]);
    p.scheduler.settle().await;
    assert_eq!(p.amount("clean_orders", "1").await, Some(15));

    let stream = p.scheduler.hub().stream("orders").unwrap();
    assert_eq!(stream.committed("clean_orders").unwrap(), 2);
}

#[tokio::test]
async fn downstream_waits_for_a_stale_upstream() {
    let p = Pipeline::open(
        &[clean(60 * MIN), revenue(5 * MIN)],
        TierProfiles::default(),
    )
    .await;
    p.order(Operation::Insert, "1", 10);

    let first = p.scheduler.tick().await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    assert_eq!(first.blocked, vec!["daily_revenue"]);
    p.scheduler.settle().await;
    p.converge().await;
    assert_eq!(p.amount("daily_revenue", "1").await, Some(10));

    p.order(Operation::Update, "1", 30);
    p.clock.advance(chrono::Duration::minutes(6));
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.marked_stale, vec!["clean_orders", "daily_revenue"]);
    let dispatched: Vec<_> = report.dispatched.iter().map(|d| d.table.as_str()).collect();
    assert_eq!(dispatched, vec!["clean_orders"]);
    assert_eq!(report.blocked, vec!["daily_revenue"]);
    assert_eq!(p.status("daily_revenue").await, TableStatus::Stale);

    p.scheduler.settle().await;
    let report = p.scheduler.tick().await.unwrap();
    let dispatched: Vec<_> = report.dispatched.iter().map(|d| d.table.as_str()).collect();
    assert_eq!(dispatched, vec!["daily_revenue"]);
    p.scheduler.settle().await;
    assert_eq!(p.amount("daily_revenue", "1").await, Some(30));
}

#[tokio::test]
async fn a_table_is_never_dispatched_twice() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    let first = p.scheduler.tick().await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    p.order(Operation::Insert, "2", 20);
    let second = p.scheduler.tick().await.unwrap();
    assert!(second.dispatched.is_empty());
    p.scheduler.settle().await;
}

#[tokio::test]
async fn exhausted_tier_defers_without_falling_back() {
    let mut tiers = TierProfiles::default();
    tiers.bulk.slots = 1;
    let p = Pipeline::open(
        &[
            clean(5 * MIN),
            DerivedTableSpec::new("big_orders", &["orders"], 5 * MIN),
        ],
        tiers,
    )
    .await;
    p.order(Operation::Insert, "1", 10);

    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.deferred.len(), 1);
    let waiting = report.deferred[0].clone();
    assert_ne!(waiting, report.dispatched[0].table);
    assert_eq!(p.status(&waiting).await, TableStatus::Stale);
    assert_eq!(p.scheduler.pool().available(ComputeTier::Bulk).unwrap(), 0);

    p.scheduler.settle().await;
    assert_eq!(p.scheduler.pool().available(ComputeTier::Bulk).unwrap(), 1);
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched[0].table, waiting);
    assert_eq!(report.dispatched[0].tier, ComputeTier::Bulk);
    p.scheduler.settle().await;
    assert_eq!(p.usage.len(), 2);
}

#[tokio::test]
async fn transform_defect_fails_the_table_and_raises_an_alert() {
    let spec = clean(5 * MIN).with_transform(TransformSpec::Named {
        name: "non_negative".to_string(),
    });
    let p = Pipeline::open(&[spec], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;

    p.order(Operation::Insert, "2", -5);
    p.scheduler.tick().await.unwrap();
    let completed = p.scheduler.settle().await;
    assert!(matches!(
        completed[0].outcome,
        RefreshOutcome::Failed { .. }
    ));
    assert_eq!(p.status("clean_orders").await, TableStatus::Failed);

    let alerts = p.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    let AlertKind::RefreshFailed { table, message } = &alerts[0].kind else {
        panic!("expected a refresh failure alert");
    };
    assert_eq!(table, "clean_orders");
    assert!(message.contains("negative amount"));

    // Readers keep the last good version, flagged stale.
    let view = p.scheduler.read("clean_orders").await.unwrap();
    assert!(view.stale);
    assert_eq!(view.table.get("1").unwrap()["amount"], json!(10));
    assert!(view.table.get("2").is_none());

    // Excluded from scheduling until an operator acts.
    p.clock.advance(chrono::Duration::hours(1));
    let report = p.scheduler.tick().await.unwrap();
    assert!(report.dispatched.is_empty());

    p.scheduler.reset_failed("clean_orders").await.unwrap();
    assert_eq!(p.status("clean_orders").await, TableStatus::Stale);
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    p.scheduler.settle().await;
}

#[tokio::test]
async fn unavailable_upstream_retries_with_backoff() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.source.set_unavailable("orders", true).unwrap();

    p.scheduler.tick().await.unwrap();
    let completed = p.scheduler.settle().await;
    let RefreshOutcome::Retrying {
        attempt, retry_at, ..
    } = &completed[0].outcome
    else {
        panic!("expected a retry, got {:?}", completed[0].outcome);
    };
    assert_eq!(*attempt, 1);
    assert_eq!(*retry_at, t0() + chrono::Duration::seconds(1));
    assert_eq!(p.status("clean_orders").await, TableStatus::Stale);
    assert!(p.alerts.alerts().is_empty());

    let report = p.scheduler.tick().await.unwrap();
    assert!(report.dispatched.is_empty());

    p.source.set_unavailable("orders", false).unwrap();
    p.clock.advance(chrono::Duration::seconds(1));
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    p.scheduler.settle().await;

    let state = p.scheduler.state("clean_orders").await.unwrap();
    assert_eq!(state.status, TableStatus::Fresh);
    assert_eq!(state.attempt, 0);
    assert!(state.retry_at.is_none());
    assert_eq!(p.amount("clean_orders", "1").await, Some(10));
}

#[tokio::test]
async fn custom_backoff_doubles_per_attempt() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    let Pipeline {
        clock,
        source,
        scheduler,
        ..
    } = p;
    let scheduler = scheduler.with_backoff(Backoff {
        base: Duration::from_secs(10),
        max: Duration::from_secs(30),
    });
    source.set_unavailable("orders", true).unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        scheduler.tick().await.unwrap();
        scheduler.settle().await;
        let state = scheduler.state("clean_orders").await.unwrap();
        let retry_at = state.retry_at.unwrap();
        delays.push((retry_at - clock.now()).num_seconds());
        clock.set(retry_at);
    }
    assert_eq!(delays, vec![10, 20, 30]);
}

#[tokio::test]
async fn forced_refresh_recomputes_on_bulk() {
    let p = Pipeline::open(&[clean(60 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;

    assert!(matches!(
        p.scheduler.force_refresh("nope").await,
        Err(Error::UnknownTable { .. })
    ));
    assert!(matches!(
        p.scheduler.reset_failed("clean_orders").await,
        Err(Error::InvalidStateTransition { .. })
    ));

    p.scheduler.force_refresh("clean_orders").await.unwrap();
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched[0].reason, RefreshReason::Forced);
    assert_eq!(report.dispatched[0].tier, ComputeTier::Bulk);
    p.scheduler.settle().await;

    let state = p.scheduler.state("clean_orders").await.unwrap();
    assert!(!state.force_requested);
    assert_eq!(state.last_reason, Some(RefreshReason::Forced));

    let statuses = p.scheduler.table_statuses().await;
    assert_eq!(statuses[0].last_tier, Some(ComputeTier::Bulk));
    assert!(!statuses[0].breaching_lag);
}

#[tokio::test]
async fn reload_adds_retires_and_recomputes() {
    let p = Pipeline::open(
        &[clean(60 * MIN), revenue(60 * MIN)],
        TierProfiles::default(),
    )
    .await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;

    let changed = clean(60 * MIN).with_transform(TransformSpec::Project {
        columns: vec!["id".to_string()],
    });
    let next = registry(&[
        changed,
        DerivedTableSpec::new("order_ids", &["clean_orders"], 60 * MIN),
    ]);
    let report = p.scheduler.reload(next).await.unwrap();
    assert_eq!(report.added, vec!["order_ids"]);
    assert_eq!(report.removed, vec!["daily_revenue"]);
    assert_eq!(report.recompute, vec!["clean_orders"]);

    assert!(p.scheduler.read("daily_revenue").await.is_none());
    assert!(p.scheduler.state("daily_revenue").await.is_none());
    let store = ObjectStateStore::new(p.backend.clone());
    assert!(store.get_state("daily_revenue").await.unwrap().is_none());

    p.converge().await;
    let view = p.scheduler.read("clean_orders").await.unwrap();
    let row = view.table.get("1").unwrap();
    assert_eq!(row["id"], json!("1"));
    assert!(row.get("amount").is_none_or(serde_json::Value::is_null));
    assert!(p.scheduler.read("order_ids").await.is_some());
}

#[tokio::test]
async fn reload_during_a_forced_refresh_recomputes_again() {
    let p = Pipeline::open(&[clean(60 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);
    p.converge().await;

    p.scheduler.force_refresh("clean_orders").await.unwrap();
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched[0].reason, RefreshReason::Forced);

    let changed = clean(60 * MIN).with_transform(TransformSpec::Project {
        columns: vec!["id".to_string()],
    });
    let report = p.scheduler.reload(registry(&[changed])).await.unwrap();
    assert_eq!(report.recompute, vec!["clean_orders"]);

    // The forced refresh still ran the old transform.
    p.scheduler.settle().await;
    let state = p.scheduler.state("clean_orders").await.unwrap();
    assert_eq!(state.status, TableStatus::Fresh);
    assert!(state.force_requested);
    assert_eq!(p.amount("clean_orders", "1").await, Some(10));

    let reports = p.converge().await;
    assert_eq!(reports[0].dispatched[0].reason, RefreshReason::Forced);
    let state = p.scheduler.state("clean_orders").await.unwrap();
    assert!(!state.force_requested);
    let view = p.scheduler.read("clean_orders").await.unwrap();
    let row = view.table.get("1").unwrap();
    assert_eq!(row["id"], json!("1"));
    assert!(row.get("amount").is_none_or(serde_json::Value::is_null));
}

#[tokio::test]
async fn shutdown_cancels_in_flight_refreshes_without_publishing() {
    let p = Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await;
    p.order(Operation::Insert, "1", 10);

    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let stopped = p.scheduler.shutdown().await;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].outcome, RefreshOutcome::Cancelled);

    assert_eq!(p.status("clean_orders").await, TableStatus::Stale);
    assert!(p.scheduler.read("clean_orders").await.is_none());
    assert!(p.backend.list("tables/").await.unwrap().is_empty());
}

#[tokio::test]
async fn run_loop_stops_on_shutdown_signal() {
    let p = Arc::new(Pipeline::open(&[clean(5 * MIN)], TierProfiles::default()).await);
    p.order(Operation::Insert, "1", 10);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let runner = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.scheduler.run(Duration::from_millis(5), rx).await })
    };
    for _ in 0..100 {
        if p.scheduler.read("clean_orders").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    runner.await.unwrap();
    assert_eq!(p.amount("clean_orders", "1").await, Some(10));
}

#[tokio::test]
async fn restart_recovers_state_data_and_offsets() {
    let clock = Arc::new(ManualClock::new(t0()));
    let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let derived = [clean(60 * MIN)];

    let first = Pipeline::open_on(
        &derived,
        TierProfiles::default(),
        clock.clone(),
        backend.clone(),
        &[],
    )
    .await;
    first.order(Operation::Insert, "1", 10);
    first.order(Operation::Insert, "2", 20);
    first.converge().await;
    drop(first);

    // Simulate a crash in the middle of a refresh.
    let store = ObjectStateStore::new(backend.clone());
    let stored = store.get_state("clean_orders").await.unwrap().unwrap();
    let mut crashed = stored.state.clone();
    crashed.status = TableStatus::Refreshing;
    assert!(
        store
            .put_state(&crashed, Some(stored.version.as_str()))
            .await
            .unwrap()
            .is_success()
    );

    // The feed is replayed on restart; only seq 3 is new to the table.
    let replay = [
        ChangeEvent::insert("orders", "1", 1, row_of([("id", json!("1")), ("amount", json!(10))])),
        ChangeEvent::insert("orders", "2", 2, row_of([("id", json!("2")), ("amount", json!(20))])),
        ChangeEvent::new(
            "orders",
            Operation::Update,
            "1",
            3,
            row_of([("amount", json!(11))]),
        ),
    ];
    let second = Pipeline::open_on(
        &derived,
        TierProfiles::default(),
        clock,
        backend,
        &replay,
    )
    .await;

    assert_eq!(second.status("clean_orders").await, TableStatus::Stale);
    assert_eq!(second.amount("clean_orders", "2").await, Some(20));
    let stream = second.scheduler.hub().stream("orders").unwrap();
    assert_eq!(stream.committed("clean_orders").unwrap(), 2);

    let report = second.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched[0].reason, RefreshReason::Incremental);
    second.scheduler.settle().await;
    assert_eq!(second.amount("clean_orders", "1").await, Some(11));
    assert_eq!(second.amount("clean_orders", "2").await, Some(20));
    let state = second.scheduler.state("clean_orders").await.unwrap();
    assert_eq!(state.watermark("orders"), 3);
}
