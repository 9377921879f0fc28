//! Dependency-aware refresh scheduling.
//!
//! The scheduler owns every [`DerivedTableState`]. Each [`tick`](Scheduler::tick)
//! runs three passes:
//!
//! 1. **Collect**: apply the results of finished refreshes (commit state,
//!    publish, commit stream offsets, record usage).
//! 2. **Staleness**: mark FRESH tables STALE when their target lag expired,
//!    an upstream moved past their watermark, or a recompute was requested.
//! 3. **Dispatch**: walk tables in topological order and start a refresh for
//!    every STALE table whose upstreams are ready and whose tier has a free
//!    slot. Tables left behind stay STALE and are reconsidered next tick.
//!
//! A table is in REFRESHING for exactly as long as one refresh task for it
//! is in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use tidemark_core::{Clock, SystemClock, TaskId, refresh_span};

use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::error::{Error, Result};
use crate::materialize::{
    CancelFlag, Materializer, PublishedTables, RefreshResult, RefreshTask, Upstream, UpstreamKind,
};
use crate::metrics::{FlowMetrics, time_scheduler_tick};
use crate::registry::{DerivedTableSpec, RegistryHandle, TableRegistry};
use crate::selector::{reserve, select_tier};
use crate::source::SourceReader;
use crate::state::{Backoff, DerivedTableState, RefreshReason, TableStatus};
use crate::store::{CasResult, StateStore, paths};
use crate::stream::StreamHub;
use crate::table::DerivedTable;
use crate::tier::{ComputeTier, TierPool, TierProfile, TierProfiles, TierSlot};
use crate::usage::{UsageMonitor, UsageSample};

/// Collaborators the scheduler is built from.
#[derive(Debug)]
pub struct SchedulerDeps {
    /// Validated table graph.
    pub registry: TableRegistry,
    /// Durable state.
    pub store: Arc<dyn StateStore>,
    /// Change streams of the source tables.
    pub hub: Arc<StreamHub>,
    /// Full scans of source tables.
    pub source: Arc<dyn SourceReader>,
    /// Compute tier profiles.
    pub tiers: TierProfiles,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Where FAILED tables are reported.
    pub alerts: Arc<dyn AlertSink>,
    /// Usage log fed by every completed refresh.
    pub usage: Arc<UsageMonitor>,
}

impl SchedulerDeps {
    /// Dependencies with default tiers, wall-clock time, tracing alerts and
    /// a fresh usage monitor.
    #[must_use]
    pub fn new(
        registry: TableRegistry,
        store: Arc<dyn StateStore>,
        hub: Arc<StreamHub>,
        source: Arc<dyn SourceReader>,
    ) -> Self {
        Self {
            registry,
            store,
            hub,
            source,
            tiers: TierProfiles::default(),
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
            usage: Arc::new(UsageMonitor::new()),
        }
    }

    /// Replaces the tier profiles.
    #[must_use]
    pub fn with_tiers(mut self, tiers: TierProfiles) -> Self {
        self.tiers = tiers;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the alert sink.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Replaces the usage monitor.
    #[must_use]
    pub fn with_usage(mut self, usage: Arc<UsageMonitor>) -> Self {
        self.usage = usage;
        self
    }
}

/// A refresh started by a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedTask {
    /// Refreshed table.
    pub table: String,
    /// Task id.
    pub task_id: TaskId,
    /// Why it runs.
    pub reason: RefreshReason,
    /// Tier it runs on.
    pub tier: ComputeTier,
}

/// How a refresh ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Committed and published.
    Fresh {
        /// Published version.
        version: u64,
        /// True if the contents changed.
        changed: bool,
    },
    /// Retryable failure; the table is STALE until `retry_at`.
    Retrying {
        /// Consecutive failures so far.
        attempt: u32,
        /// Earliest next dispatch.
        retry_at: DateTime<Utc>,
        /// Error description.
        message: String,
    },
    /// Non-retryable failure; the table is FAILED.
    Failed {
        /// Error description.
        message: String,
    },
    /// Cancelled before committing; the table is STALE.
    Cancelled,
    /// The table was removed by a reload while the refresh ran.
    Discarded,
}

/// A refresh whose result was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRefresh {
    /// Refreshed table.
    pub table: String,
    /// Task id.
    pub task_id: TaskId,
    /// Result.
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Scheduling epoch (one per tick).
    pub epoch: u64,
    /// Refreshes collected at the start of the tick.
    pub completed: Vec<CompletedRefresh>,
    /// Tables moved from FRESH to STALE.
    pub marked_stale: Vec<String>,
    /// Refreshes started.
    pub dispatched: Vec<DispatchedTask>,
    /// STALE tables left waiting for tier capacity.
    pub deferred: Vec<String>,
    /// STALE tables left waiting for their upstreams.
    pub blocked: Vec<String>,
}

/// Tables added, removed or scheduled for recompute by a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// New tables, awaiting backfill.
    pub added: Vec<String>,
    /// Retired tables.
    pub removed: Vec<String>,
    /// Tables whose definition changed; a forced recompute is queued.
    pub recompute: Vec<String>,
}

/// A consistent view of a derived table for readers.
#[derive(Debug, Clone)]
pub struct ReadView {
    /// Last published contents. Never a partially applied refresh.
    pub table: Arc<DerivedTable>,
    /// Current status.
    pub status: TableStatus,
    /// True if the data is FAILED or older than the target lag.
    pub stale: bool,
    /// When the published data was produced.
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Operator-facing status of one derived table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatusReport {
    /// Table name.
    pub table: String,
    /// Target lag.
    #[serde(with = "humantime_serde")]
    pub target_lag: Duration,
    /// Current status.
    pub status: TableStatus,
    /// Reason of the last dispatched refresh.
    pub last_reason: Option<RefreshReason>,
    /// Tier of the last dispatched refresh.
    pub last_tier: Option<ComputeTier>,
    /// Completion of the last successful refresh.
    pub last_refresh_completed_at: Option<DateTime<Utc>>,
    /// Time since that completion.
    #[serde(with = "humantime_serde")]
    pub since_last_refresh: Option<Duration>,
    /// True if the target lag is currently breached.
    pub breaching_lag: bool,
    /// Version readers see.
    pub published_version: u64,
    /// Last failure message.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Tracked {
    state: DerivedTableState,
    version: Option<String>,
}

impl Tracked {
    fn new(table: &str) -> Self {
        Self {
            state: DerivedTableState::new(table),
            version: None,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    task_id: TaskId,
    reason: RefreshReason,
    force_generation: u64,
    slot: TierSlot,
    cancel: CancelFlag,
    dispatched_at: DateTime<Utc>,
    started: Instant,
    handle: JoinHandle<(Result<RefreshResult>, Duration)>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Tracked>,
    in_flight: HashMap<String, InFlight>,
    epoch: u64,
}

/// The dependency scheduler.
#[derive(Debug)]
pub struct Scheduler {
    registry: RegistryHandle,
    store: Arc<dyn StateStore>,
    hub: Arc<StreamHub>,
    published: Arc<PublishedTables>,
    materializer: Materializer,
    pool: TierPool,
    usage: Arc<UsageMonitor>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    metrics: FlowMetrics,
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// Builds a scheduler and restores its durable state.
    ///
    /// Tables found REFRESHING (a refresh was interrupted) return to STALE;
    /// published data and stream consumer offsets are reloaded; states of
    /// tables no longer configured are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    pub async fn open(deps: SchedulerDeps) -> Result<Self> {
        let published = Arc::new(PublishedTables::new());
        let materializer = Materializer::new(
            Arc::clone(&deps.hub),
            deps.source,
            Arc::clone(&published),
            Arc::clone(&deps.store),
        );
        let scheduler = Self {
            registry: RegistryHandle::new(deps.registry),
            store: deps.store,
            hub: deps.hub,
            published,
            materializer,
            pool: TierPool::new(deps.tiers),
            usage: deps.usage,
            alerts: deps.alerts,
            clock: deps.clock,
            backoff: Backoff::default(),
            metrics: FlowMetrics::new(),
            inner: Mutex::new(Inner::default()),
        };
        scheduler.restore().await?;
        Ok(scheduler)
    }

    /// Replaces the retry backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current registry.
    #[must_use]
    pub fn registry(&self) -> Arc<TableRegistry> {
        self.registry.current()
    }

    /// Change streams.
    #[must_use]
    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    /// Published tables.
    #[must_use]
    pub fn published(&self) -> &Arc<PublishedTables> {
        &self.published
    }

    /// Usage monitor.
    #[must_use]
    pub fn usage(&self) -> &Arc<UsageMonitor> {
        &self.usage
    }

    /// Compute tier pool.
    #[must_use]
    pub fn pool(&self) -> &TierPool {
        &self.pool
    }

    async fn restore(&self) -> Result<()> {
        let registry = self.registry.current();
        for source in registry.sources() {
            self.hub.register(source)?;
        }

        let mut stored: HashMap<String, _> = self
            .store
            .load_states()
            .await?
            .into_iter()
            .map(|s| (s.state.table.clone(), s))
            .collect();

        let mut inner = self.inner.lock().await;
        for name in registry.refresh_order() {
            let mut tracked = match stored.remove(name) {
                Some(s) => Tracked {
                    state: s.state,
                    version: Some(s.version),
                },
                None => {
                    let mut tracked = Tracked::new(name);
                    self.persist(&mut tracked, DerivedTableState::new(name.as_str()))
                        .await?;
                    tracked
                }
            };

            let mut next = tracked.state.clone();
            if next.status == TableStatus::Refreshing {
                next.transition(TableStatus::Stale)?;
            }
            if next.backfilled {
                if let Some(table) = self.load_published(name, next.published_version).await? {
                    self.published.publish(Arc::new(table));
                } else {
                    tracing::warn!(
                        table = %name,
                        version = next.published_version,
                        "published data missing; table will be backfilled again"
                    );
                    next.backfilled = false;
                    next.published_version = 0;
                    next.watermarks.clear();
                    if next.status == TableStatus::Fresh {
                        next.transition(TableStatus::Stale)?;
                    }
                }
            }
            if next != tracked.state {
                self.persist(&mut tracked, next).await?;
            }

            if let Some(spec) = registry.spec(name) {
                self.restore_offsets(&registry, spec, &tracked.state).await?;
            }
            inner.tables.insert(name.clone(), tracked);
        }

        for name in stored.into_keys() {
            self.store.delete_state(&name).await?;
            tracing::info!(table = %name, "retired state of unconfigured table");
        }

        tracing::info!(tables = inner.tables.len(), "scheduler state restored");
        Ok(())
    }

    async fn load_published(&self, name: &str, version: u64) -> Result<Option<DerivedTable>> {
        if version == 0 {
            return Ok(Some(DerivedTable::new(name)));
        }
        self.store.read_table(name, version).await
    }

    async fn restore_offsets(
        &self,
        registry: &TableRegistry,
        spec: &DerivedTableSpec,
        state: &DerivedTableState,
    ) -> Result<()> {
        for upstream in spec.upstreams.iter().filter(|u| registry.is_source(u)) {
            let stream = self.hub.stream(upstream)?;
            stream.register_consumer(&spec.name)?;
            let offset = self
                .store
                .load_offset(upstream, &spec.name)
                .await?
                .max(state.watermark(upstream));
            stream.commit(&spec.name, offset)?;
        }
        Ok(())
    }

    /// Writes `next` with compare-and-swap and adopts it on success.
    async fn persist(&self, tracked: &mut Tracked, next: DerivedTableState) -> Result<()> {
        match self
            .store
            .put_state(&next, tracked.version.as_deref())
            .await?
        {
            CasResult::Success { version } => {
                if next.status != tracked.state.status {
                    self.metrics.record_transition(
                        &next.table,
                        tracked.state.status.as_str(),
                        next.status.as_str(),
                    );
                }
                tracked.state = next;
                tracked.version = Some(version);
                Ok(())
            }
            CasResult::VersionConflict { .. } => Err(Error::ConcurrentModification {
                key: paths::state(&next.table),
                expected: tracked
                    .version
                    .clone()
                    .unwrap_or_else(|| "none".to_string()),
            }),
        }
    }

    /// Runs one scheduling tick.
    ///
    /// # Errors
    ///
    /// Returns an error if table state cannot be persisted. Refresh failures
    /// are not errors of the tick; they are reported in the [`TickReport`].
    pub async fn tick(&self) -> Result<TickReport> {
        let _timer = time_scheduler_tick();
        let registry = self.registry.current();
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;

        let mut report = TickReport {
            epoch: inner.epoch,
            ..TickReport::default()
        };
        report.completed = self.collect(&mut inner, &registry, false).await;

        let now = self.clock.now();
        report.marked_stale = self.mark_stale(&mut inner, &registry, now).await?;
        self.dispatch(&mut inner, &registry, now, &mut report)
            .await?;

        tracing::debug!(
            epoch = report.epoch,
            completed = report.completed.len(),
            marked_stale = report.marked_stale.len(),
            dispatched = report.dispatched.len(),
            deferred = report.deferred.len(),
            blocked = report.blocked.len(),
            "scheduler tick"
        );
        Ok(report)
    }

    /// Waits for every in-flight refresh and applies its result.
    pub async fn settle(&self) -> Vec<CompletedRefresh> {
        let registry = self.registry.current();
        let mut inner = self.inner.lock().await;
        self.collect(&mut inner, &registry, true).await
    }

    /// Cancels every in-flight refresh and waits for them to stop.
    ///
    /// Cancelled tables return to STALE with nothing published.
    pub async fn shutdown(&self) -> Vec<CompletedRefresh> {
        let registry = self.registry.current();
        let mut inner = self.inner.lock().await;
        for flight in inner.in_flight.values() {
            flight.cancel.cancel();
        }
        self.collect(&mut inner, &registry, true).await
    }

    /// Ticks every `tick_interval` until `shutdown` turns true, then shuts down.
    ///
    /// Tick errors are logged and the loop continues.
    pub async fn run(&self, tick_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let stopped = self.shutdown().await;
        tracing::info!(cancelled = stopped.len(), "scheduler stopped");
    }

    async fn collect(
        &self,
        inner: &mut Inner,
        registry: &TableRegistry,
        wait: bool,
    ) -> Vec<CompletedRefresh> {
        let mut finished: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, flight)| wait || flight.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        let rank = |name: &String| {
            registry
                .refresh_order()
                .iter()
                .position(|t| t == name)
                .unwrap_or(usize::MAX)
        };
        finished.sort_by_key(rank);

        let mut completed = Vec::with_capacity(finished.len());
        for name in finished {
            let Some(flight) = inner.in_flight.remove(&name) else {
                continue;
            };
            match self.complete(inner, registry, &name, flight).await {
                Ok(done) => completed.push(done),
                Err(e) => {
                    tracing::error!(table = %name, error = %e, "failed to apply refresh result");
                }
            }
        }
        completed
    }

    async fn complete(
        &self,
        inner: &mut Inner,
        registry: &TableRegistry,
        name: &str,
        flight: InFlight,
    ) -> Result<CompletedRefresh> {
        let InFlight {
            task_id,
            reason,
            force_generation,
            slot,
            dispatched_at,
            started,
            handle,
            ..
        } = flight;
        let (outcome, elapsed) = match handle.await {
            Ok(done) => done,
            Err(e) => (
                Err(Error::storage(format!("refresh task for {name} stopped: {e}"))),
                started.elapsed(),
            ),
        };
        let tier = slot.tier();
        let profile: TierProfile = slot.profile().clone();
        drop(slot);

        let finished_at =
            dispatched_at + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
        self.usage.record(UsageSample::priced(
            task_id,
            name,
            tier,
            reason,
            &profile,
            dispatched_at,
            finished_at,
        ));

        let Some(tracked) = inner.tables.get_mut(name) else {
            return Ok(CompletedRefresh {
                table: name.to_string(),
                task_id,
                outcome: RefreshOutcome::Discarded,
            });
        };

        let now = self.clock.now();
        let (outcome, label) = match outcome {
            Ok(result) => {
                self.commit_success(tracked, registry, reason, force_generation, result, now)
                    .await?
            }
            Err(Error::Cancelled { .. }) => {
                let mut next = tracked.state.clone();
                next.transition(TableStatus::Stale)?;
                self.persist_or_adopt(tracked, next).await;
                tracing::info!(table = %name, "refresh cancelled");
                (RefreshOutcome::Cancelled, "cancelled")
            }
            Err(e) if e.is_retryable() => (self.retry_later(tracked, &e, now).await?, "retry"),
            Err(e) => {
                let mut next = tracked.state.clone();
                next.transition(TableStatus::Failed)?;
                next.last_error = Some(e.to_string());
                self.persist_or_adopt(tracked, next).await;
                tracing::error!(
                    table = %name,
                    error = %e,
                    "refresh failed; table excluded until operator action"
                );
                if let Err(send_err) = self
                    .alerts
                    .send(&Alert::refresh_failed(name, e.to_string(), now))
                    .await
                {
                    tracing::warn!(table = %name, error = %send_err, "failed to deliver alert");
                }
                (
                    RefreshOutcome::Failed {
                        message: e.to_string(),
                    },
                    "failed",
                )
            }
        };

        self.metrics
            .observe_refresh(tier.as_str(), reason.as_str(), label, elapsed);
        Ok(CompletedRefresh {
            table: name.to_string(),
            task_id,
            outcome,
        })
    }

    async fn commit_success(
        &self,
        tracked: &mut Tracked,
        registry: &TableRegistry,
        reason: RefreshReason,
        force_generation: u64,
        result: RefreshResult,
        now: DateTime<Utc>,
    ) -> Result<(RefreshOutcome, &'static str)> {
        let mut next = tracked.state.clone();
        next.transition(TableStatus::Fresh)?;
        for (upstream, position) in &result.watermarks {
            next.advance_watermark(upstream, *position);
        }
        next.last_refresh_completed_at = Some(now);
        next.backfilled = true;
        if reason == RefreshReason::Forced {
            next.clear_force(force_generation);
        }
        next.attempt = 0;
        next.retry_at = None;
        next.last_error = None;
        next.published_version = result.table.version();

        // The state write commits the refresh; publish and offsets follow it.
        if let Err(e) = self.persist(tracked, next).await {
            return Ok((self.retry_later(tracked, &e, now).await?, "retry"));
        }
        self.published.publish(Arc::clone(&result.table));
        self.commit_offsets(registry, &tracked.state.table, &result.watermarks)
            .await;

        tracing::info!(
            table = %tracked.state.table,
            reason = %reason,
            version = result.table.version(),
            changed = result.changed,
            rows_read = result.rows_read,
            "refresh committed"
        );
        Ok((
            RefreshOutcome::Fresh {
                version: result.table.version(),
                changed: result.changed,
            },
            "ok",
        ))
    }

    async fn commit_offsets(
        &self,
        registry: &TableRegistry,
        table: &str,
        watermarks: &BTreeMap<String, u64>,
    ) {
        for (upstream, &position) in watermarks {
            if !registry.is_source(upstream) {
                continue;
            }
            let committed = match self.hub.stream(upstream) {
                Ok(stream) => stream
                    .commit(table, position)
                    .and_then(|_| stream.truncate_committed()),
                Err(e) => Err(e),
            };
            if let Err(e) = committed {
                tracing::warn!(
                    table,
                    upstream = %upstream,
                    error = %e,
                    "failed to commit stream offset"
                );
            }
            if let Err(e) = self.store.save_offset(upstream, table, position).await {
                tracing::warn!(
                    table,
                    upstream = %upstream,
                    error = %e,
                    "failed to persist stream offset"
                );
            }
        }
    }

    async fn retry_later(
        &self,
        tracked: &mut Tracked,
        error: &Error,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome> {
        let mut next = tracked.state.clone();
        next.transition(TableStatus::Stale)?;
        next.attempt = next.attempt.saturating_add(1);
        let delay = self.backoff.delay(next.attempt);
        let retry_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        next.retry_at = Some(retry_at);
        next.last_error = Some(error.to_string());
        let attempt = next.attempt;
        tracing::warn!(
            table = %next.table,
            attempt,
            retry_at = %retry_at,
            error = %error,
            "refresh failed; will retry"
        );
        self.persist_or_adopt(tracked, next).await;
        Ok(RefreshOutcome::Retrying {
            attempt,
            retry_at,
            message: error.to_string(),
        })
    }

    /// Persists `next`; if that fails, keeps it in memory so the table does
    /// not stay REFRESHING. The stale version token makes the next write
    /// fail loudly if the lost write did land.
    async fn persist_or_adopt(&self, tracked: &mut Tracked, next: DerivedTableState) {
        if let Err(e) = self.persist(tracked, next.clone()).await {
            tracing::error!(table = %next.table, error = %e, "failed to persist table state");
            tracked.state = next;
        }
    }

    async fn mark_stale(
        &self,
        inner: &mut Inner,
        registry: &TableRegistry,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut marked = Vec::new();
        for name in registry.refresh_order() {
            let (Some(tracked), Some(spec)) = (inner.tables.get(name), registry.spec(name)) else {
                continue;
            };
            let state = &tracked.state;
            if state.status != TableStatus::Fresh {
                continue;
            }
            let trigger = if state.force_requested {
                "recompute requested"
            } else if state.lag_breached(now, spec.target_lag) {
                "target lag expired"
            } else if self.upstream_advanced(registry, spec, state)? {
                "upstream advanced"
            } else {
                continue;
            };

            let mut next = state.clone();
            next.transition(TableStatus::Stale)?;
            if let Some(tracked) = inner.tables.get_mut(name) {
                self.persist(tracked, next).await?;
            }
            tracing::debug!(table = %name, trigger, "table marked stale");
            marked.push(name.clone());
        }
        Ok(marked)
    }

    fn upstream_advanced(
        &self,
        registry: &TableRegistry,
        spec: &DerivedTableSpec,
        state: &DerivedTableState,
    ) -> Result<bool> {
        for upstream in &spec.upstreams {
            let position = if registry.is_source(upstream) {
                self.hub.stream(upstream)?.head()?
            } else {
                self.published.get(upstream).map_or(0, |t| t.version())
            };
            if position > state.watermark(upstream) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dependencies_ready(
        tables: &BTreeMap<String, Tracked>,
        registry: &TableRegistry,
        spec: &DerivedTableSpec,
        reason: RefreshReason,
    ) -> bool {
        spec.upstreams
            .iter()
            .filter(|u| !registry.is_source(u))
            .all(|u| {
                tables.get(u).is_some_and(|up| {
                    if reason.is_full_recompute() {
                        up.state.backfilled
                    } else {
                        up.state.status == TableStatus::Fresh
                    }
                })
            })
    }

    async fn dispatch(
        &self,
        inner: &mut Inner,
        registry: &TableRegistry,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        for name in registry.refresh_order() {
            if inner.in_flight.contains_key(name) {
                continue;
            }
            let (Some(tracked), Some(spec), Some(transform)) = (
                inner.tables.get(name),
                registry.spec(name),
                registry.transform(name),
            ) else {
                continue;
            };
            let state = &tracked.state;
            if state.status != TableStatus::Stale || state.backing_off(now) {
                continue;
            }

            let reason = state.next_reason();
            let force_generation = state.force_generation;
            if !Self::dependencies_ready(&inner.tables, registry, spec, reason) {
                report.blocked.push(name.clone());
                continue;
            }

            let tier = select_tier(reason);
            let slot = match reserve(&self.pool, reason) {
                Ok(slot) => slot,
                Err(Error::CapacityExhausted { .. }) => {
                    self.metrics.record_dispatch(tier.as_str(), "capacity");
                    report.deferred.push(name.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let task = RefreshTask {
                task_id: TaskId::generate(),
                target_table: name.clone(),
                reason,
                assigned_tier: tier,
                upstreams: spec
                    .upstreams
                    .iter()
                    .map(|u| Upstream {
                        name: u.clone(),
                        kind: if registry.is_source(u) {
                            UpstreamKind::Source
                        } else {
                            UpstreamKind::Derived
                        },
                    })
                    .collect(),
                transform,
                watermarks: state.watermarks.clone(),
                base_version: state.published_version,
            };
            let mut next = state.clone();
            next.transition(TableStatus::Refreshing)?;
            next.last_reason = Some(reason);
            next.last_tier = Some(tier);

            if let Some(tracked) = inner.tables.get_mut(name) {
                self.persist(tracked, next).await?;
            }

            let cancel = CancelFlag::new();
            let task_id = task.task_id;
            let materializer = self.materializer.clone();
            let run_cancel = cancel.clone();
            let span = refresh_span(name, reason.as_str(), tier.as_str());
            let handle = tokio::spawn(
                async move {
                    let started = Instant::now();
                    let outcome = materializer.refresh(task, run_cancel).await;
                    (outcome, started.elapsed())
                }
                .instrument(span),
            );

            inner.in_flight.insert(
                name.clone(),
                InFlight {
                    task_id,
                    reason,
                    force_generation,
                    slot,
                    cancel,
                    dispatched_at: now,
                    started: Instant::now(),
                    handle,
                },
            );
            self.metrics.record_dispatch(tier.as_str(), "dispatched");
            tracing::info!(
                table = %name,
                reason = %reason,
                tier = %tier,
                task_id = %task_id,
                "refresh dispatched"
            );
            report.dispatched.push(DispatchedTask {
                table: name.clone(),
                task_id,
                reason,
                tier,
            });
        }
        Ok(())
    }

    /// Requests a full recompute of `table` on the bulk tier.
    ///
    /// Also clears FAILED and any retry backoff. If a refresh is in flight
    /// the recompute runs after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if `table` is not a derived table.
    pub async fn force_refresh(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::UnknownTable {
                table: table.to_string(),
            })?;
        let mut next = tracked.state.clone();
        next.request_force();
        next.attempt = 0;
        next.retry_at = None;
        if matches!(next.status, TableStatus::Fresh | TableStatus::Failed) {
            next.transition(TableStatus::Stale)?;
        }
        self.persist(tracked, next).await?;
        tracing::info!(table, "forced recompute requested");
        Ok(())
    }

    /// Returns a FAILED table to STALE so it is scheduled again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] for an unknown table and
    /// [`Error::InvalidStateTransition`] if the table is not FAILED.
    pub async fn reset_failed(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::UnknownTable {
                table: table.to_string(),
            })?;
        if tracked.state.status != TableStatus::Failed {
            return Err(Error::InvalidStateTransition {
                table: table.to_string(),
                from: tracked.state.status.to_string(),
                to: TableStatus::Stale.to_string(),
            });
        }
        let mut next = tracked.state.clone();
        next.transition(TableStatus::Stale)?;
        next.attempt = 0;
        next.retry_at = None;
        self.persist(tracked, next).await?;
        tracing::info!(table, "failed table reset");
        Ok(())
    }

    /// Installs a new, already validated registry.
    ///
    /// New tables start unbackfilled. Tables whose upstreams or transform
    /// changed get a forced recompute. Removed tables are retired: their
    /// refresh is cancelled, their state deleted and their data unpublished.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be persisted.
    pub async fn reload(&self, registry: TableRegistry) -> Result<ReloadReport> {
        let mut inner = self.inner.lock().await;
        let previous = self.registry.current();
        let mut report = ReloadReport::default();

        for source in registry.sources() {
            self.hub.register(source)?;
        }

        for name in registry.refresh_order() {
            if let Some(tracked) = inner.tables.get_mut(name) {
                if registry.definition_changed(&previous, name) {
                    let mut next = tracked.state.clone();
                    next.request_force();
                    if next.status == TableStatus::Failed {
                        next.transition(TableStatus::Stale)?;
                        next.attempt = 0;
                        next.retry_at = None;
                    }
                    self.persist(tracked, next).await?;
                    report.recompute.push(name.clone());
                }
            } else {
                let mut tracked = Tracked::new(name);
                self.persist(&mut tracked, DerivedTableState::new(name.as_str()))
                    .await?;
                inner.tables.insert(name.clone(), tracked);
                report.added.push(name.clone());
            }
            if let (Some(spec), Some(tracked)) = (registry.spec(name), inner.tables.get(name)) {
                self.restore_offsets(&registry, spec, &tracked.state).await?;
            }
        }

        let removed: Vec<String> = inner
            .tables
            .keys()
            .filter(|name| registry.spec(name).is_none())
            .cloned()
            .collect();
        for name in removed {
            inner.tables.remove(&name);
            if let Some(flight) = inner.in_flight.get(&name) {
                flight.cancel.cancel();
            }
            if let Some(spec) = previous.spec(&name) {
                for upstream in spec.upstreams.iter().filter(|u| previous.is_source(u)) {
                    if let Ok(stream) = self.hub.stream(upstream) {
                        stream.unregister_consumer(&name)?;
                    }
                }
            }
            self.store.delete_state(&name).await?;
            self.published.retire(&name);
            report.removed.push(name);
        }

        self.registry.swap(registry);
        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            recompute = report.recompute.len(),
            "registry reloaded"
        );
        Ok(report)
    }

    /// The published data of `table` with its status and staleness.
    ///
    /// Returns `None` for unknown tables and tables never backfilled.
    pub async fn read(&self, table: &str) -> Option<ReadView> {
        let data = self.published.get(table)?;
        let registry = self.registry.current();
        let spec = registry.spec(table)?;
        let inner = self.inner.lock().await;
        let state = &inner.tables.get(table)?.state;
        let now = self.clock.now();
        Some(ReadView {
            table: data,
            status: state.status,
            stale: state.status == TableStatus::Failed || state.lag_breached(now, spec.target_lag),
            refreshed_at: state.last_refresh_completed_at,
        })
    }

    /// Status of a single table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if `table` is not a derived table.
    pub async fn status(&self, table: &str) -> Result<TableStatus> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.state.status)
            .ok_or_else(|| Error::UnknownTable {
                table: table.to_string(),
            })
    }

    /// Full refresh state of a single table.
    pub async fn state(&self, table: &str) -> Option<DerivedTableState> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.state.clone())
    }

    /// Status report of every derived table, in refresh order.
    pub async fn table_statuses(&self) -> Vec<TableStatusReport> {
        let registry = self.registry.current();
        let inner = self.inner.lock().await;
        let now = self.clock.now();
        registry
            .refresh_order()
            .iter()
            .filter_map(|name| {
                let spec = registry.spec(name)?;
                let state = &inner.tables.get(name)?.state;
                Some(TableStatusReport {
                    table: name.clone(),
                    target_lag: spec.target_lag,
                    status: state.status,
                    last_reason: state.last_reason,
                    last_tier: state.last_tier,
                    last_refresh_completed_at: state.last_refresh_completed_at,
                    since_last_refresh: state
                        .last_refresh_completed_at
                        .and_then(|done| now.signed_duration_since(done).to_std().ok()),
                    breaching_lag: state.lag_breached(now, spec.target_lag),
                    published_version: state.published_version,
                    last_error: state.last_error.clone(),
                })
            })
            .collect()
    }
}
