//! Source table access.
//!
//! Source tables live in an external transactional database. Two things are
//! read from it: the ordered change feed (through the
//! [`StreamHub`](crate::stream::StreamHub)) and, for backfills, a consistent
//! full scan. A [`SourceSnapshot`] records the stream sequence it is
//! consistent with, so the backfill can start consuming the stream exactly
//! after it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::stream::{AppendOutcome, ChangeEvent, Operation, StreamHub};

/// A consistent full scan of one source table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSnapshot {
    /// Rows keyed by primary key.
    pub rows: BTreeMap<String, Row>,
    /// Highest stream sequence reflected in `rows`.
    pub as_of_sequence: u64,
}

/// Reads full source table state for backfills.
#[async_trait]
pub trait SourceReader: Send + Sync + std::fmt::Debug {
    /// Scans `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the source cannot be read.
    async fn snapshot(&self, table: &str) -> Result<SourceSnapshot>;
}

#[derive(Debug, Default)]
struct SourceState {
    tables: HashMap<String, SourceSnapshot>,
    unavailable: HashSet<String>,
}

/// In-process source database.
///
/// Applying an event updates the table and appends the event to the change
/// stream under one lock, so snapshots and the stream always agree. Used by
/// tests and by the service binary when replaying a change feed file.
#[derive(Debug)]
pub struct InMemorySource {
    hub: Arc<StreamHub>,
    state: Mutex<SourceState>,
}

impl InMemorySource {
    /// Creates a source feeding `hub`.
    #[must_use]
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self {
            hub,
            state: Mutex::new(SourceState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SourceState>> {
        self.state
            .lock()
            .map_err(|_| Error::storage("source lock poisoned"))
    }

    /// Registers a source table and its change stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn register(&self, table: &str) -> Result<()> {
        self.hub.register(table)?;
        self.lock()?.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    /// Applies a committed source mutation and publishes it on the stream.
    ///
    /// Duplicates are dropped without touching the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] for an unregistered table, or the
    /// stream's append error.
    pub fn apply(&self, event: ChangeEvent) -> Result<AppendOutcome> {
        let mut state = self.lock()?;
        let table = state
            .tables
            .get_mut(&event.source_table)
            .ok_or_else(|| Error::UnknownTable {
                table: event.source_table.clone(),
            })?;

        let pk = event.primary_key.clone();
        let sequence = event.source_sequence;
        let operation = event.operation;
        let payload = event.payload.clone();

        let outcome = self.hub.append(event)?;
        if outcome == AppendOutcome::Accepted {
            match operation {
                Operation::Insert => {
                    table.rows.insert(pk, payload);
                }
                Operation::Update => {
                    let row = table.rows.entry(pk).or_default();
                    for (column, value) in payload {
                        row.insert(column, value);
                    }
                }
                Operation::Delete => {
                    table.rows.remove(&pk);
                }
            }
            table.as_of_sequence = sequence;
        }
        Ok(outcome)
    }

    /// Applies a mutation with the next free sequence number.
    ///
    /// Returns the assigned sequence.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub fn commit(
        &self,
        table: &str,
        operation: Operation,
        primary_key: &str,
        payload: Row,
    ) -> Result<u64> {
        let sequence = self.hub.stream(table)?.next_sequence()?;
        self.apply(ChangeEvent::new(
            table,
            operation,
            primary_key,
            sequence,
            payload,
        ))?;
        Ok(sequence)
    }

    /// Makes reads of `table` fail (or succeed again).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_unavailable(&self, table: &str, unavailable: bool) -> Result<()> {
        let mut state = self.lock()?;
        if unavailable {
            state.unavailable.insert(table.to_string());
        } else {
            state.unavailable.remove(table);
        }
        Ok(())
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    async fn snapshot(&self, table: &str) -> Result<SourceSnapshot> {
        let state = self.lock()?;
        if state.unavailable.contains(table) {
            return Err(Error::UpstreamUnavailable {
                upstream: table.to_string(),
                message: "source unreachable".to_string(),
            });
        }
        state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::UnknownTable {
                table: table.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::row::row_of;

    fn source() -> InMemorySource {
        let source = InMemorySource::new(Arc::new(StreamHub::new()));
        source.register("orders").unwrap();
        source
    }

    #[tokio::test]
    async fn snapshot_tracks_applied_sequence() {
        let source = source();
        source
            .commit("orders", Operation::Insert, "1", row_of([("v", json!(10))]))
            .unwrap();
        let seq = source
            .commit("orders", Operation::Update, "1", row_of([("s", json!("paid"))]))
            .unwrap();

        let snap = source.snapshot("orders").await.unwrap();
        assert_eq!(snap.as_of_sequence, seq);
        assert_eq!(snap.rows["1"], row_of([("v", json!(10)), ("s", json!("paid"))]));
    }

    #[tokio::test]
    async fn duplicate_events_do_not_touch_rows() {
        let source = source();
        source
            .apply(ChangeEvent::insert("orders", "1", 1, row_of([("v", json!(10))])))
            .unwrap();
        source.apply(ChangeEvent::delete("orders", "1", 2)).unwrap();
        let outcome = source
            .apply(ChangeEvent::insert("orders", "1", 1, row_of([("v", json!(10))])))
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Duplicate);
        assert!(source.snapshot("orders").await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn unavailable_source_is_retryable() {
        let source = source();
        source.set_unavailable("orders", true).unwrap();
        let err = source.snapshot("orders").await.unwrap_err();
        assert!(err.is_retryable());
        source.set_unavailable("orders", false).unwrap();
        assert!(source.snapshot("orders").await.is_ok());
    }
}
