//! Error types for the retention store.

use chrono::{DateTime, Utc};

use tidemark_core::BackupId;

/// The result type used throughout tidemark-retention.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in retention operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A delete or modify hit a record whose retention has not expired.
    #[error("retention record {backup_id} is locked until {retention_until}")]
    RetentionLocked {
        /// The locked record.
        backup_id: BackupId,
        /// Instant the lock expires.
        retention_until: DateTime<Utc>,
    },

    /// A modify hit an expired record. Records are never modified.
    #[error("retention record {backup_id} is immutable")]
    Immutable {
        /// The record.
        backup_id: BackupId,
    },

    /// A snapshot of the same table at the same instant already exists.
    #[error("snapshot of {table} at {snapshot_timestamp} already exists")]
    DuplicateSnapshot {
        /// Snapshotted table.
        table: String,
        /// Snapshot instant.
        snapshot_timestamp: DateTime<Utc>,
    },

    /// No record with this id.
    #[error("retention record not found: {backup_id}")]
    RecordNotFound {
        /// The missing record.
        backup_id: BackupId,
    },

    /// The snapshot source has no such table.
    #[error("table not available for snapshot: {table}")]
    TableUnavailable {
        /// The table.
        table: String,
    },

    /// A retained payload no longer matches its recorded digest.
    #[error("payload of {backup_id} fails integrity check: expected {expected}, found {actual}")]
    IntegrityMismatch {
        /// The record.
        backup_id: BackupId,
        /// Recorded SHA-256.
        expected: String,
        /// SHA-256 of the stored bytes.
        actual: String,
    },

    /// The retention period cannot be represented.
    #[error("retention period overflows from {from}")]
    RetentionOverflow {
        /// Snapshot instant.
        from: DateTime<Utc>,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tidemark-core, including the medium's own retention lock.
    #[error("core error: {0}")]
    Core(#[from] tidemark_core::Error),
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
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

    /// Returns true if the refusal came from either retention layer.
    #[must_use]
    pub const fn is_retention_locked(&self) -> bool {
        matches!(
            self,
            Self::RetentionLocked { .. } | Self::Core(tidemark_core::Error::RetentionLocked { .. })
        )
    }
}
