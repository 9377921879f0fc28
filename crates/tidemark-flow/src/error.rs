//! Error types for change ingestion, materialization and scheduling.

use chrono::{DateTime, Utc};

use crate::tier::ComputeTier;

/// The result type used throughout tidemark-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in flow operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the table dependency graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// Tables participating in the cycle.
        cycle: Vec<String>,
    },

    /// A table name is not registered.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// The table that was not found.
        table: String,
    },

    /// A derived table names an upstream that does not exist.
    #[error("table {table} depends on unknown upstream {upstream}")]
    DependencyNotFound {
        /// The derived table.
        table: String,
        /// The missing upstream.
        upstream: String,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// An invalid status transition was attempted.
    #[error("invalid state transition for {table}: {from} -> {to}")]
    InvalidStateTransition {
        /// The table whose status was being changed.
        table: String,
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
    },

    /// A change event arrived with a sequence that can no longer be accepted.
    ///
    /// Only raised for events further behind the head than the deduplication
    /// window; redeliveries inside the window are reported as duplicates.
    #[error("out-of-order event for {table}: sequence {sequence} <= head {head}")]
    OutOfOrder {
        /// Source table of the event.
        table: String,
        /// Sequence of the rejected event.
        sequence: u64,
        /// Highest accepted sequence.
        head: u64,
    },

    /// The transform rejected its input. Not retryable.
    #[error("transform failed for {table}: {message}")]
    Transform {
        /// Derived table whose transform failed.
        table: String,
        /// Description of the defect.
        message: String,
    },

    /// An upstream could not be read. Retryable with backoff.
    #[error("upstream {upstream} unavailable: {message}")]
    UpstreamUnavailable {
        /// The upstream that could not be read.
        upstream: String,
        /// Description of the failure.
        message: String,
    },

    /// No slot is free on the requested compute tier.
    #[error("no capacity left on {tier} tier")]
    CapacityExhausted {
        /// The exhausted tier.
        tier: ComputeTier,
    },

    /// A refresh was cancelled before it committed.
    #[error("refresh of {table} cancelled")]
    Cancelled {
        /// The table whose refresh was cancelled.
        table: String,
    },

    /// A state write lost a compare-and-swap race.
    #[error("concurrent modification of {key}: expected version {expected}")]
    ConcurrentModification {
        /// Storage key that was modified.
        key: String,
        /// The version the writer expected.
        expected: String,
    },

    /// A table is not eligible for the requested operation yet.
    #[error("{table} cannot be refreshed before {retry_at}")]
    BackingOff {
        /// The table in backoff.
        table: String,
        /// Earliest retry instant.
        retry_at: DateTime<Utc>,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tidemark-core.
    #[error("core error: {0}")]
    Core(#[from] tidemark_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns true if a failed refresh should be retried on a later tick.
    ///
    /// Transform defects and configuration problems need an operator and are
    /// never retried; everything transient is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { .. }
            | Self::CapacityExhausted { .. }
            | Self::Cancelled { .. }
            | Self::ConcurrentModification { .. }
            | Self::BackingOff { .. }
            | Self::Storage { .. } => true,
            Self::Core(inner) => matches!(
                inner,
                tidemark_core::Error::Storage { .. } | tidemark_core::Error::Internal { .. }
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn cycle_error_display() {
        let err = Error::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn out_of_order_display_names_sequence() {
        let err = Error::OutOfOrder {
            table: "orders".into(),
            sequence: 3,
            head: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("sequence 3"));
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(
            Error::UpstreamUnavailable {
                upstream: "orders".into(),
                message: "timeout".into(),
            }
            .is_retryable()
        );
        assert!(
            !Error::Transform {
                table: "orders_clean".into(),
                message: "bad column".into(),
            }
            .is_retryable()
        );
        assert!(
            Error::CapacityExhausted {
                tier: ComputeTier::Bulk
            }
            .is_retryable()
        );
        assert!(!Error::configuration("missing").is_retryable());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::storage_with_source("failed to read file", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
