//! Incremental materializer.
//!
//! A refresh computes the next version of one derived table:
//!
//! - **Full recompute** (`INITIAL_BACKFILL`, `FORCED`): scan every upstream in
//!   full, transform, and replace the table. Each upstream watermark starts at
//!   the position the scan is consistent with.
//! - **Incremental**: read every upstream's changes strictly after the stored
//!   watermark and apply them with upsert-by-key semantics.
//!
//! Work happens on a private staged copy. Readers keep seeing the published
//! table until the scheduler commits the refresh and publishes the copy, so a
//! failed or cancelled refresh has no visible effect.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use tidemark_core::TaskId;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::source::SourceReader;
use crate::state::RefreshReason;
use crate::store::StateStore;
use crate::stream::{ChangeEvent, Operation, StreamHub};
use crate::table::{DerivedTable, RowChange, RowOp};
use crate::tier::ComputeTier;
use crate::transform::Transform;

/// Default number of change events read per poll.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Where an upstream's rows come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// A source table: Change Stream plus full scans through a [`SourceReader`].
    Source,
    /// Another derived table: its published data and commit versions.
    Derived,
}

/// One upstream of a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Table name.
    pub name: String,
    /// Source or derived.
    pub kind: UpstreamKind,
}

/// A unit of refresh work for one derived table.
#[derive(Debug, Clone)]
pub struct RefreshTask {
    /// Unique task id.
    pub task_id: TaskId,
    /// Table being refreshed.
    pub target_table: String,
    /// Why the refresh runs.
    pub reason: RefreshReason,
    /// Tier the task was scheduled on.
    pub assigned_tier: ComputeTier,
    /// Upstreams, in configuration order.
    pub upstreams: Vec<Upstream>,
    /// Row transform.
    pub transform: Arc<dyn Transform>,
    /// Watermarks at dispatch time.
    pub watermarks: BTreeMap<String, u64>,
    /// Version readers saw at dispatch time.
    pub base_version: u64,
}

/// Outcome of a successful refresh, not yet committed.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    /// Task that produced the result.
    pub task_id: TaskId,
    /// The refreshed table, sealed and durably written.
    pub table: Arc<DerivedTable>,
    /// Watermarks reflected in `table`.
    pub watermarks: BTreeMap<String, u64>,
    /// True if the table contents changed.
    pub changed: bool,
    /// Change events or scanned rows read from upstreams.
    pub rows_read: usize,
    /// When the refresh started.
    pub started_at: DateTime<Utc>,
    /// When the refresh finished.
    pub finished_at: DateTime<Utc>,
}

/// Cooperative cancellation flag shared between the scheduler and a refresh.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a raised-never flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The table versions readers see.
///
/// Publishing swaps a whole `Arc<DerivedTable>`, so a reader holding a
/// snapshot is never affected by later refreshes.
#[derive(Debug, Default)]
pub struct PublishedTables {
    tables: RwLock<HashMap<String, Arc<DerivedTable>>>,
}

impl PublishedTables {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current published version of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<DerivedTable>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Makes `table` the version readers see.
    pub fn publish(&self, table: Arc<DerivedTable>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.name().to_string(), table);
    }

    /// Stops serving `name`.
    pub fn retire(&self, name: &str) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Names of published tables, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Executes refresh tasks.
#[derive(Debug, Clone)]
pub struct Materializer {
    hub: Arc<StreamHub>,
    source: Arc<dyn SourceReader>,
    published: Arc<PublishedTables>,
    store: Arc<dyn StateStore>,
    batch_size: usize,
}

impl Materializer {
    /// Creates a materializer.
    #[must_use]
    pub fn new(
        hub: Arc<StreamHub>,
        source: Arc<dyn SourceReader>,
        published: Arc<PublishedTables>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            hub,
            source,
            published,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Overrides the poll batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Published tables this materializer reads derived upstreams from.
    #[must_use]
    pub fn published(&self) -> &Arc<PublishedTables> {
        &self.published
    }

    /// Runs a refresh.
    ///
    /// On success the staged table is durably written (if it changed) but
    /// not published and its watermarks are not committed; both are the
    /// scheduler's job.
    ///
    /// # Errors
    ///
    /// - [`Error::Transform`] if the transform rejects a row (not retryable)
    /// - [`Error::UpstreamUnavailable`] if an upstream cannot be read
    /// - [`Error::Cancelled`] if `cancel` was raised before the durable write
    pub async fn refresh(&self, task: RefreshTask, cancel: CancelFlag) -> Result<RefreshResult> {
        let started_at = Utc::now();
        let mut staged = self
            .published
            .get(&task.target_table)
            .map_or_else(|| DerivedTable::new(&task.target_table), |t| (*t).clone());
        if !task.reason.is_full_recompute() && staged.version() != task.base_version {
            return Err(Error::storage(format!(
                "published data of {} is at version {} but state expects {}",
                task.target_table,
                staged.version(),
                task.base_version
            )));
        }

        let mut watermarks = task.watermarks.clone();
        let (changed, rows_read) = if task.reason.is_full_recompute() {
            self.recompute(&task, &mut staged, &mut watermarks, &cancel)
                .await?
        } else {
            self.apply_changes(&task, &mut staged, &mut watermarks, &cancel)?
        };

        check_cancel(&task, &cancel)?;
        let version = staged.seal();
        if version > task.base_version {
            self.store.write_table(&staged).await?;
        }

        tracing::debug!(
            table = %task.target_table,
            reason = %task.reason,
            version,
            rows_read,
            changed,
            "refresh staged"
        );

        Ok(RefreshResult {
            task_id: task.task_id,
            table: Arc::new(staged),
            watermarks,
            changed,
            rows_read,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn recompute(
        &self,
        task: &RefreshTask,
        staged: &mut DerivedTable,
        watermarks: &mut BTreeMap<String, u64>,
        cancel: &CancelFlag,
    ) -> Result<(bool, usize)> {
        let mut rows: BTreeMap<String, (Row, BTreeMap<String, u64>)> = BTreeMap::new();
        let mut rows_read = 0;

        for upstream in &task.upstreams {
            check_cancel(task, cancel)?;
            let (scanned, position) = match upstream.kind {
                UpstreamKind::Source => {
                    let snapshot = self.source.snapshot(&upstream.name).await?;
                    (snapshot.rows, snapshot.as_of_sequence)
                }
                UpstreamKind::Derived => {
                    let table = self.derived_upstream(&upstream.name)?;
                    (table.snapshot_rows(), table.version())
                }
            };

            for (pk, row) in scanned {
                rows_read += 1;
                let Some(out) = run_transform(task, &upstream.name, &row)? else {
                    continue;
                };
                let entry = rows.entry(pk).or_default();
                for (column, value) in out {
                    entry.0.insert(column, value);
                }
                entry.1.insert(upstream.name.clone(), position);
            }
            watermarks.insert(upstream.name.clone(), position);
        }

        Ok((staged.replace_all(rows), rows_read))
    }

    fn apply_changes(
        &self,
        task: &RefreshTask,
        staged: &mut DerivedTable,
        watermarks: &mut BTreeMap<String, u64>,
        cancel: &CancelFlag,
    ) -> Result<(bool, usize)> {
        let mut changed = false;
        let mut rows_read = 0;

        for upstream in &task.upstreams {
            let mut position = watermarks.get(&upstream.name).copied().unwrap_or(0);
            match upstream.kind {
                UpstreamKind::Source => {
                    let stream = self.hub.stream(&upstream.name)?;
                    loop {
                        check_cancel(task, cancel)?;
                        let batch = stream.poll(position, self.batch_size)?;
                        let Some(last) = batch.last_sequence() else {
                            break;
                        };
                        for event in batch.iter() {
                            rows_read += 1;
                            changed |= staged.apply(&to_row_change(task, event)?);
                        }
                        position = last;
                    }
                }
                UpstreamKind::Derived => {
                    check_cancel(task, cancel)?;
                    let table = self.derived_upstream(&upstream.name)?;
                    for event in table.changes_since(position) {
                        rows_read += 1;
                        changed |= staged.apply(&to_row_change(task, &event)?);
                    }
                    position = position.max(table.version());
                }
            }
            watermarks.insert(upstream.name.clone(), position);
        }

        Ok((changed, rows_read))
    }

    fn derived_upstream(&self, name: &str) -> Result<Arc<DerivedTable>> {
        self.published
            .get(name)
            .ok_or_else(|| Error::UpstreamUnavailable {
                upstream: name.to_string(),
                message: "no published data yet".to_string(),
            })
    }
}

fn check_cancel(task: &RefreshTask, cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled {
            table: task.target_table.clone(),
        });
    }
    Ok(())
}

fn run_transform(task: &RefreshTask, upstream: &str, row: &Row) -> Result<Option<Row>> {
    task.transform
        .apply(upstream, row)
        .map_err(|failure| Error::Transform {
            table: task.target_table.clone(),
            message: failure.message,
        })
}

/// Maps an upstream change through the transform.
///
/// An upsert the transform filters out becomes a delete, so a row that stops
/// matching leaves the derived table.
fn to_row_change(task: &RefreshTask, event: &ChangeEvent) -> Result<RowChange> {
    let op = match event.operation {
        Operation::Delete => RowOp::Delete,
        Operation::Insert | Operation::Update => {
            match run_transform(task, &event.source_table, &event.payload)? {
                Some(row) => RowOp::Upsert(row),
                None => RowOp::Delete,
            }
        }
    };
    Ok(RowChange {
        upstream: event.source_table.clone(),
        sequence: event.source_sequence,
        primary_key: event.primary_key.clone(),
        op,
    })
}
