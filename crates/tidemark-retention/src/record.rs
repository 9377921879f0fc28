//! Retention records and their storage layout.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tidemark_core::BackupId;

use crate::error::{Error, Result};

/// Minimum retention of a snapshot: seven years.
pub const RETENTION_MONTHS: u32 = 7 * 12;

/// Prefix of record metadata objects.
pub const RECORD_PREFIX: &str = "retention/records/";

/// Prefix of retained payload objects.
pub const PAYLOAD_PREFIX: &str = "retention/payloads/";

/// Metadata of one retained snapshot. Never changes once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRecord {
    /// Unique id.
    pub backup_id: BackupId,
    /// Snapshotted table.
    pub source_table: String,
    /// When the snapshot was taken.
    pub snapshot_timestamp: DateTime<Utc>,
    /// Earliest instant the record may be deleted.
    pub retention_until: DateTime<Utc>,
    /// Storage path of the payload.
    pub payload_ref: String,
    /// Hex SHA-256 of the payload.
    pub payload_sha256: String,
    /// Payload size in bytes.
    pub payload_size: u64,
    /// Rows in the snapshot.
    pub row_count: u64,
    /// Version of the table that was captured.
    pub source_version: u64,
    /// Who wrote the snapshot.
    pub writer_identity: String,
}

impl RetentionRecord {
    /// True while the record may not be deleted.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        now < self.retention_until
    }

    /// Storage path of the record metadata.
    #[must_use]
    pub fn record_path(&self) -> String {
        record_path(&self.source_table, self.backup_id)
    }
}

/// Retention deadline of a snapshot taken at `snapshot_timestamp`.
///
/// # Errors
///
/// Returns [`Error::RetentionOverflow`] if the date cannot be represented.
pub fn retention_until(snapshot_timestamp: DateTime<Utc>) -> Result<DateTime<Utc>> {
    snapshot_timestamp
        .checked_add_months(Months::new(RETENTION_MONTHS))
        .ok_or(Error::RetentionOverflow {
            from: snapshot_timestamp,
        })
}

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `retention/records/{table}/{backup_id}.json`
#[must_use]
pub fn record_path(table: &str, backup_id: BackupId) -> String {
    format!("{RECORD_PREFIX}{table}/{backup_id}.json")
}

/// `retention/payloads/{table}/{backup_id}.json`
#[must_use]
pub fn payload_path(table: &str, backup_id: BackupId) -> String {
    format!("{PAYLOAD_PREFIX}{table}/{backup_id}.json")
}
