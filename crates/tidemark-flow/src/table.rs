//! Derived table contents.
//!
//! A [`DerivedTable`] maps primary keys to rows. Each row remembers, per
//! upstream, the highest sequence that wrote it; a change only applies if its
//! sequence is strictly greater. Deletes leave a tombstone carrying the same
//! versions, so an older upsert redelivered after a delete cannot resurrect
//! the row. Together these make change application idempotent and
//! last-write-wins by sequence rather than by arrival order.
//!
//! The table's `version` increases by one each time a refresh changes it.
//! Rows record the version they last changed in, which lets a derived table
//! act as a change feed for tables downstream of it.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::row::Row;
use crate::stream::{ChangeEvent, Operation};

/// What a single change does to a row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Merge these columns into the row (creating it if absent).
    Upsert(Row),
    /// Remove the row.
    Delete,
}

/// A change addressed to one derived row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Upstream table that produced the change.
    pub upstream: String,
    /// Upstream sequence (or upstream table version) of the change.
    pub sequence: u64,
    /// Primary key of the derived row.
    pub primary_key: String,
    /// The mutation.
    pub op: RowOp,
}

/// A row plus the metadata needed for idempotent application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRow {
    /// Column values. Empty for tombstones.
    pub values: Row,
    /// Highest applied sequence per upstream.
    pub versions: BTreeMap<String, u64>,
    /// Table version in which the row last changed.
    pub committed_in: u64,
    /// True if the row is a tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl VersionedRow {
    fn tombstone(committed_in: u64) -> Self {
        Self {
            values: Row::new(),
            versions: BTreeMap::new(),
            committed_in,
            deleted: true,
        }
    }

    fn accepts(&self, upstream: &str, sequence: u64) -> bool {
        self.versions.get(upstream).is_none_or(|&seen| sequence > seen)
    }
}

/// The materialized contents of one derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTable {
    name: String,
    columns: Vec<String>,
    rows: BTreeMap<String, VersionedRow>,
    version: u64,
    #[serde(skip)]
    dirty: bool,
}

impl DerivedTable {
    /// Creates an empty table at version 0.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            rows: BTreeMap::new(),
            version: 0,
            dirty: false,
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Committed version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Columns in order of first appearance.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of live rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.values().filter(|r| !r.deleted).count()
    }

    /// Returns true if the table has no live rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a live row by primary key.
    #[must_use]
    pub fn get(&self, primary_key: &str) -> Option<&Row> {
        self.rows
            .get(primary_key)
            .filter(|r| !r.deleted)
            .map(|r| &r.values)
    }

    /// Iterates over live rows in primary key order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &Row)> {
        self.rows
            .iter()
            .filter(|(_, r)| !r.deleted)
            .map(|(pk, r)| (pk.as_str(), &r.values))
    }

    /// Returns true if uncommitted changes are pending.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn pending_version(&self) -> u64 {
        self.version + 1
    }

    fn add_columns<'a>(&mut self, names: impl Iterator<Item = &'a String>) {
        for name in names {
            if self.columns.iter().any(|c| c == name) {
                continue;
            }
            self.columns.push(name.clone());
            for row in self.rows.values_mut().filter(|r| !r.deleted) {
                row.values.entry(name.clone()).or_insert(Value::Null);
            }
        }
    }

    fn fill_missing(&self, values: &mut Row) {
        for column in &self.columns {
            values.entry(column.clone()).or_insert(Value::Null);
        }
    }

    /// Applies one change. Returns true if the table changed.
    ///
    /// Stale changes (sequence not above the row's version for the same
    /// upstream) are ignored, which makes re-application a no-op.
    pub fn apply(&mut self, change: &RowChange) -> bool {
        if let Some(existing) = self.rows.get(&change.primary_key) {
            if !existing.accepts(&change.upstream, change.sequence) {
                return false;
            }
        }
        let pending = self.pending_version();

        match &change.op {
            RowOp::Upsert(payload) => {
                self.add_columns(payload.keys());
                let before = self
                    .rows
                    .get(&change.primary_key)
                    .filter(|r| !r.deleted)
                    .map(|r| r.values.clone());
                let mut values = before.clone().unwrap_or_default();
                for (column, value) in payload {
                    values.insert(column.clone(), value.clone());
                }
                self.fill_missing(&mut values);
                let changed = before.as_ref() != Some(&values);

                let row = self
                    .rows
                    .entry(change.primary_key.clone())
                    .or_insert_with(|| VersionedRow::tombstone(pending));
                row.versions.insert(change.upstream.clone(), change.sequence);
                if changed {
                    row.values = values;
                    row.deleted = false;
                    row.committed_in = pending;
                    self.dirty = true;
                }
                changed
            }
            RowOp::Delete => {
                let current = self.version;
                let row = self
                    .rows
                    .entry(change.primary_key.clone())
                    .or_insert_with(|| VersionedRow::tombstone(current));
                row.versions.insert(change.upstream.clone(), change.sequence);
                if row.deleted {
                    return false;
                }
                row.deleted = true;
                row.values = Row::new();
                row.committed_in = pending;
                self.dirty = true;
                true
            }
        }
    }

    /// Replaces the whole contents with a full recompute.
    ///
    /// `rows` maps primary key to the recomputed values and the upstream
    /// versions they reflect. Rows that disappear become tombstones so the
    /// removal is visible through [`changes_since`](Self::changes_since).
    /// Returns true if anything changed.
    pub fn replace_all(&mut self, rows: BTreeMap<String, (Row, BTreeMap<String, u64>)>) -> bool {
        let pending = self.pending_version();
        let mut changed = false;

        for (pk, existing) in &mut self.rows {
            if !existing.deleted && !rows.contains_key(pk) {
                existing.deleted = true;
                existing.values = Row::new();
                existing.committed_in = pending;
                changed = true;
            }
        }

        for (values, _) in rows.values() {
            self.add_columns(values.keys());
        }

        for (pk, (mut values, versions)) in rows {
            self.fill_missing(&mut values);
            match self.rows.get_mut(&pk) {
                Some(existing) if !existing.deleted && existing.values == values => {
                    existing.versions = versions;
                }
                Some(existing) => {
                    existing.values = values;
                    existing.versions = versions;
                    existing.deleted = false;
                    existing.committed_in = pending;
                    changed = true;
                }
                None => {
                    self.rows.insert(
                        pk,
                        VersionedRow {
                            values,
                            versions,
                            committed_in: pending,
                            deleted: false,
                        },
                    );
                    changed = true;
                }
            }
        }

        self.dirty |= changed;
        changed
    }

    /// Commits pending changes, bumping the version if anything changed.
    ///
    /// Returns the version after the call.
    pub fn seal(&mut self) -> u64 {
        if self.dirty {
            self.version += 1;
            self.dirty = false;
        }
        self.version
    }

    /// Rows (and tombstones) changed after `version`, as change events.
    ///
    /// The event sequence is the table version the row changed in, so a
    /// downstream consumer can use this table's version as its watermark.
    #[must_use]
    pub fn changes_since(&self, version: u64) -> Vec<ChangeEvent> {
        let now = Utc::now();
        let mut changes: Vec<ChangeEvent> = self
            .rows
            .iter()
            .filter(|(_, r)| r.committed_in > version && r.committed_in <= self.version)
            .map(|(pk, r)| ChangeEvent {
                source_table: self.name.clone(),
                operation: if r.deleted {
                    Operation::Delete
                } else {
                    Operation::Update
                },
                primary_key: pk.clone(),
                payload: r.values.clone(),
                source_sequence: r.committed_in,
                source_timestamp: now,
            })
            .collect();
        changes.sort_by_key(|c| c.source_sequence);
        changes
    }

    /// Live rows with their full values, for full recompute of a downstream table.
    #[must_use]
    pub fn snapshot_rows(&self) -> BTreeMap<String, Row> {
        self.rows()
            .map(|(pk, row)| (pk.to_string(), row.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::row::row_of;

    fn upsert(pk: &str, seq: u64, pairs: &[(&str, Value)]) -> RowChange {
        RowChange {
            upstream: "orders".into(),
            sequence: seq,
            primary_key: pk.into(),
            op: RowOp::Upsert(row_of(pairs.iter().cloned())),
        }
    }

    fn delete(pk: &str, seq: u64) -> RowChange {
        RowChange {
            upstream: "orders".into(),
            sequence: seq,
            primary_key: pk.into(),
            op: RowOp::Delete,
        }
    }

    #[test]
    fn delete_wins_over_late_older_update() {
        let mut table = DerivedTable::new("orders_clean");
        assert!(table.apply(&upsert("1", 1, &[("v", json!(10))])));
        assert!(table.apply(&upsert("1", 2, &[("v", json!(20))])));
        assert!(table.apply(&delete("1", 3)));
        assert!(!table.apply(&upsert("1", 2, &[("v", json!(20))])));
        assert!(table.get("1").is_none());
    }

    #[test]
    fn reapplying_is_a_noop() {
        let mut table = DerivedTable::new("orders_clean");
        let change = upsert("1", 1, &[("v", json!(10))]);
        table.apply(&change);
        table.seal();
        let before = table.clone();
        assert!(!table.apply(&change));
        assert_eq!(table.seal(), before.version());
        assert_eq!(table, before);
    }

    #[test]
    fn partial_payload_keeps_absent_columns() {
        let mut table = DerivedTable::new("orders_clean");
        table.apply(&upsert("1", 1, &[("v", json!(10)), ("status", json!("new"))]));
        table.apply(&upsert("1", 2, &[("status", json!("paid"))]));
        let row = table.get("1").unwrap();
        assert_eq!(row["v"], json!(10));
        assert_eq!(row["status"], json!("paid"));
    }

    #[test]
    fn new_columns_back_fill_null() {
        let mut table = DerivedTable::new("orders_clean");
        table.apply(&upsert("1", 1, &[("v", json!(10))]));
        table.apply(&upsert("2", 2, &[("v", json!(5)), ("region", json!("eu"))]));
        assert_eq!(table.columns(), ["v", "region"]);
        assert_eq!(table.get("1").unwrap()["region"], Value::Null);
        assert_eq!(table.get("2").unwrap()["region"], json!("eu"));
    }

    #[test]
    fn versions_are_tracked_per_upstream() {
        let mut table = DerivedTable::new("joined");
        table.apply(&upsert("1", 9, &[("a", json!(1))]));
        let other = RowChange {
            upstream: "customers".into(),
            sequence: 1,
            primary_key: "1".into(),
            op: RowOp::Upsert(row_of([("b", json!(2))])),
        };
        assert!(table.apply(&other));
        assert_eq!(table.get("1").unwrap()["a"], json!(1));
        assert_eq!(table.get("1").unwrap()["b"], json!(2));
    }

    #[test]
    fn seal_bumps_only_when_dirty() {
        let mut table = DerivedTable::new("t");
        assert_eq!(table.seal(), 0);
        table.apply(&upsert("1", 1, &[("v", json!(1))]));
        assert_eq!(table.seal(), 1);
        assert_eq!(table.seal(), 1);
    }

    #[test]
    fn changes_since_reports_upserts_and_tombstones() {
        let mut table = DerivedTable::new("t");
        table.apply(&upsert("1", 1, &[("v", json!(1))]));
        table.apply(&upsert("2", 2, &[("v", json!(2))]));
        table.seal();
        table.apply(&delete("1", 3));
        table.seal();

        let changes = table.changes_since(1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Delete);
        assert_eq!(changes[0].primary_key, "1");
        assert_eq!(changes[0].source_sequence, 2);
        assert_eq!(table.changes_since(0).len(), 2);
    }

    #[test]
    fn replace_all_tombstones_vanished_rows() {
        let mut table = DerivedTable::new("t");
        table.apply(&upsert("1", 1, &[("v", json!(1))]));
        table.apply(&upsert("2", 2, &[("v", json!(2))]));
        table.seal();

        let mut rows = BTreeMap::new();
        rows.insert(
            "2".to_string(),
            (row_of([("v", json!(2))]), BTreeMap::from([("orders".to_string(), 5)])),
        );
        assert!(table.replace_all(rows));
        assert_eq!(table.seal(), 2);
        assert!(table.get("1").is_none());
        assert_eq!(table.len(), 1);
        let changes = table.changes_since(1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Delete);
    }
}
