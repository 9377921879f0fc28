//! Where snapshots are read from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// One row, keyed by column.
pub type SnapshotRow = Map<String, Value>;

/// The contents of a curated table at one version. This is the retained payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Table version captured.
    pub version: u64,
    /// Rows by primary key.
    pub rows: BTreeMap<String, SnapshotRow>,
}

/// Reads the current, consistent contents of a curated table.
#[async_trait]
pub trait SnapshotSource: Send + Sync + std::fmt::Debug {
    /// Current contents of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableUnavailable`](crate::error::Error::TableUnavailable)
    /// if the table has nothing to snapshot.
    async fn read_table(&self, table: &str) -> Result<TableSnapshot>;
}
