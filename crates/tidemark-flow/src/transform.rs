//! Transform execution boundary.
//!
//! A derived table's transform maps one upstream row to at most one output
//! row with the same primary key. The query engine behind it is opaque; the
//! materializer only sees the [`Transform`] trait. Returning `Ok(None)`
//! means the row does not belong in the output (and is removed if present).
//!
//! Built-in transforms cover the common cases; anything else is registered by
//! name in a [`TransformCatalog`] by the embedding application.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::row::Row;

/// A transform defect: the input cannot be processed by this logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    /// Description of the failure.
    pub message: String,
}

impl TransformFailure {
    /// Creates a failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Row-level transform logic for a derived table.
pub trait Transform: Send + Sync + fmt::Debug {
    /// Transforms one row read from `upstream`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransformFailure`] if the logic cannot handle the row.
    /// Failures are not retried.
    fn apply(
        &self,
        upstream: &str,
        row: &Row,
    ) -> std::result::Result<Option<Row>, TransformFailure>;
}

/// Passes rows through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(
        &self,
        _upstream: &str,
        row: &Row,
    ) -> std::result::Result<Option<Row>, TransformFailure> {
        Ok(Some(row.clone()))
    }
}

/// Keeps only the listed columns.
///
/// Columns absent from the input stay absent, so partial payloads remain
/// partial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    columns: Vec<String>,
}

impl Project {
    /// Creates a projection onto `columns`.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl Transform for Project {
    fn apply(
        &self,
        _upstream: &str,
        row: &Row,
    ) -> std::result::Result<Option<Row>, TransformFailure> {
        Ok(Some(
            self.columns
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect(),
        ))
    }
}

/// Keeps rows whose `column` equals `equals`.
///
/// A row without the column (a partial update) is kept: the filter cannot be
/// evaluated on it and the row was admitted when the column was last seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    column: String,
    equals: Value,
}

impl Filter {
    /// Creates an equality filter.
    #[must_use]
    pub fn new(column: impl Into<String>, equals: Value) -> Self {
        Self {
            column: column.into(),
            equals,
        }
    }
}

impl Transform for Filter {
    fn apply(
        &self,
        _upstream: &str,
        row: &Row,
    ) -> std::result::Result<Option<Row>, TransformFailure> {
        match row.get(&self.column) {
            Some(value) if *value != self.equals => Ok(None),
            _ => Ok(Some(row.clone())),
        }
    }
}

/// Serializable description of a transform, as found in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Pass rows through.
    #[default]
    Identity,
    /// Keep a subset of columns.
    Project {
        /// Columns to keep.
        columns: Vec<String>,
    },
    /// Keep rows where a column equals a value.
    Filter {
        /// Column to test.
        column: String,
        /// Required value.
        equals: Value,
    },
    /// A transform registered in the catalog under this name.
    Named {
        /// Catalog name.
        name: String,
    },
}

/// Named transforms supplied by the embedding application.
#[derive(Debug, Clone, Default)]
pub struct TransformCatalog {
    named: HashMap<String, Arc<dyn Transform>>,
}

impl TransformCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named transform, replacing any previous one.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
        self.register(name, transform);
        self
    }

    /// Registers a named transform, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, transform: Arc<dyn Transform>) {
        self.named.insert(name.into(), transform);
    }

    /// Builds the transform described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown named transform or an
    /// empty projection.
    pub fn resolve(&self, spec: &TransformSpec) -> Result<Arc<dyn Transform>> {
        match spec {
            TransformSpec::Identity => Ok(Arc::new(Identity)),
            TransformSpec::Project { columns } if columns.is_empty() => {
                Err(Error::configuration("project transform needs at least one column"))
            }
            TransformSpec::Project { columns } => Ok(Arc::new(Project::new(columns.clone()))),
            TransformSpec::Filter { column, equals } => {
                Ok(Arc::new(Filter::new(column.clone(), equals.clone())))
            }
            TransformSpec::Named { name } => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| Error::configuration(format!("unknown transform '{name}'"))),
        }
    }
}
