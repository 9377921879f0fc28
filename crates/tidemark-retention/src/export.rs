//! De-identified research exports of retained snapshots.
//!
//! Retained payloads are never altered. An export reads a snapshot, passes
//! every row through a [`Redactor`] and hands the result to the caller.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use tidemark_core::BackupId;

use crate::error::{Error, Result};
use crate::source::SnapshotRow;
use crate::store::RetentionStore;

/// De-identifies a row. Must be a pure function of the row.
pub trait Redactor: Send + Sync + std::fmt::Debug {
    /// Returns the de-identified row.
    fn redact(&self, row: &SnapshotRow) -> SnapshotRow;
}

/// Replaces the values of sensitive columns with a fixed mask.
#[derive(Debug, Clone)]
pub struct ColumnMaskRedactor {
    columns: BTreeSet<String>,
    mask: Value,
}

impl ColumnMaskRedactor {
    /// Default mask value.
    pub const MASK: &'static str = "REDACTED";

    /// Masks `columns` with [`MASK`](Self::MASK).
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            mask: Value::String(Self::MASK.to_string()),
        }
    }

    /// Uses `mask` instead of the default.
    #[must_use]
    pub fn with_mask(mut self, mask: Value) -> Self {
        self.mask = mask;
        self
    }
}

impl Redactor for ColumnMaskRedactor {
    fn redact(&self, row: &SnapshotRow) -> SnapshotRow {
        row.iter()
            .map(|(column, value)| {
                let value = if self.columns.contains(column) && !value.is_null() {
                    self.mask.clone()
                } else {
                    value.clone()
                };
                (column.clone(), value)
            })
            .collect()
    }
}

/// A redacted copy of one retained snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchExport {
    /// Source record.
    pub backup_id: BackupId,
    /// Snapshotted table.
    pub source_table: String,
    /// When the snapshot was taken.
    pub snapshot_timestamp: DateTime<Utc>,
    /// Redacted rows by primary key. Keys are opaque ordinals, not source keys.
    pub rows: BTreeMap<String, SnapshotRow>,
}

impl ResearchExport {
    /// Builds an export of `backup_id` through `redactor`.
    ///
    /// The payload digest is verified first.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown or its payload fails the
    /// integrity check.
    pub async fn from_record(
        store: &RetentionStore,
        backup_id: BackupId,
        redactor: &dyn Redactor,
    ) -> Result<Self> {
        let record = store
            .get(backup_id)
            .ok_or(Error::RecordNotFound { backup_id })?;
        let snapshot = store.read_snapshot(backup_id).await?;

        let rows = snapshot
            .rows
            .values()
            .enumerate()
            .map(|(ordinal, row)| (format!("{ordinal:08}"), redactor.redact(row)))
            .collect();

        tracing::info!(
            backup_id = %backup_id,
            table = %record.source_table,
            rows = snapshot.rows.len(),
            "research export built"
        );
        Ok(Self {
            backup_id,
            source_table: record.source_table,
            snapshot_timestamp: record.snapshot_timestamp,
            rows,
        })
    }

    /// Rows as JSON lines.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a row cannot be encoded.
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for row in self.rows.values() {
            out.push_str(&serde_json::to_string(row).map_err(Error::serialization)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> SnapshotRow {
        match value {
            Value::Object(map) => map,
            _ => SnapshotRow::new(),
        }
    }

    #[test]
    fn masks_only_listed_non_null_columns() {
        let redactor = ColumnMaskRedactor::new(["name", "dob"]);
        let redacted = redactor.redact(&row(json!({
            "name": "Ada", "dob": null, "amount": 12
        })));
        assert_eq!(redacted["name"], json!("REDACTED"));
        assert_eq!(redacted["dob"], Value::Null);
        assert_eq!(redacted["amount"], json!(12));
    }

    #[test]
    fn redaction_is_pure() {
        let redactor = ColumnMaskRedactor::new(["ssn"]).with_mask(json!("***"));
        let input = row(json!({"ssn": "123", "zip": "02139"}));
        assert_eq!(redactor.redact(&input), redactor.redact(&input));
        assert_eq!(input["ssn"], json!("123"));
    }
}
