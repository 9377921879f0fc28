//! The WORM retention store.
//!
//! Retention is enforced twice:
//!
//! 1. **Logical layer** (this module): every delete or modify first checks
//!    the record's `retention_until` against the store clock, audits the
//!    decision, and refuses while the record is locked.
//! 2. **Physical layer** ([`StorageBackend::put_retained`]): payloads and
//!    records are written with an object lock that the medium enforces with
//!    its own clock, whatever the caller does.
//!
//! Deleting an expired record is allowed but never automatic. Modifying a
//! record is never allowed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use tidemark_core::{
    AuditAction, AuditEvent, AuditLedger, AuditSink, BackupId, Clock, StorageBackend,
    SystemClock, WriteResult, retention_span,
};

use crate::error::{Error, Result};
use crate::record::{RECORD_PREFIX, RetentionRecord, payload_path, retention_until, sha256_hex};
use crate::source::{SnapshotSource, TableSnapshot};

/// Decision reasons written to the audit trail.
pub mod reasons {
    /// New snapshot written.
    pub const SNAPSHOT: &str = "snapshot";
    /// Refused: retention has not expired.
    pub const RETENTION_LOCKED: &str = "retention_locked";
    /// Allowed: retention expired.
    pub const EXPIRED: &str = "expired";
    /// Refused: records are never modified.
    pub const IMMUTABLE: &str = "immutable";
}

/// Append-only store of retained table snapshots.
pub struct RetentionStore {
    storage: Arc<dyn StorageBackend>,
    source: Arc<dyn SnapshotSource>,
    ledger: AuditLedger,
    clock: Arc<dyn Clock>,
    writer_identity: String,
    index: RwLock<BTreeMap<BackupId, RetentionRecord>>,
    table_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for RetentionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionStore")
            .field("writer_identity", &self.writer_identity)
            .finish_non_exhaustive()
    }
}

impl RetentionStore {
    /// Opens the store, rebuilding the index from the records on `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if records cannot be listed or decoded.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        source: Arc<dyn SnapshotSource>,
        writer_identity: impl Into<String>,
    ) -> Result<Self> {
        let mut index = BTreeMap::new();
        for meta in storage.list(RECORD_PREFIX).await? {
            let raw = storage.get(&meta.path).await?;
            let record: RetentionRecord = serde_json::from_slice(&raw).map_err(|e| {
                Error::serialization(format!("invalid retention record {}: {e}", meta.path))
            })?;
            index.insert(record.backup_id, record);
        }
        tracing::info!(records = index.len(), "retention index loaded");

        Ok(Self {
            ledger: AuditLedger::with_tracing(Arc::clone(&storage)),
            storage,
            source,
            clock: Arc::new(SystemClock),
            writer_identity: writer_identity.into(),
            index: RwLock::new(index),
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the clock used for retention decisions.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirrors audit events to `sink` in addition to the persisted ledger.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.ledger = AuditLedger::new(Arc::clone(&self.storage), sink);
        self
    }

    /// Identity recorded as the writer of new snapshots.
    #[must_use]
    pub fn writer_identity(&self) -> &str {
        &self.writer_identity
    }

    /// The audit ledger.
    #[must_use]
    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Snapshots the current contents of `table` into a new record.
    ///
    /// Snapshots of the same table run one at a time.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSnapshot`] if the table was already snapshotted at this instant
    /// - [`Error::TableUnavailable`] if the source has nothing to snapshot
    /// - storage errors if the payload or record cannot be written
    pub async fn snapshot(&self, table: &str) -> Result<RetentionRecord> {
        let lock = self.table_lock(table);
        let _serialized = lock.lock().await;
        self.snapshot_locked(table)
            .instrument(retention_span("snapshot", table))
            .await
    }

    async fn snapshot_locked(&self, table: &str) -> Result<RetentionRecord> {
        let now = self.clock.now();
        let duplicate = self
            .read_index()
            .values()
            .any(|r| r.source_table == table && r.snapshot_timestamp == now);
        if duplicate {
            return Err(Error::DuplicateSnapshot {
                table: table.to_string(),
                snapshot_timestamp: now,
            });
        }

        let snapshot: TableSnapshot = self.source.read_table(table).await?;
        let payload = serde_json::to_vec(&snapshot).map_err(Error::serialization)?;
        let backup_id = BackupId::generate();
        let retain_until = retention_until(now)?;

        let record = RetentionRecord {
            backup_id,
            source_table: table.to_string(),
            snapshot_timestamp: now,
            retention_until: retain_until,
            payload_ref: payload_path(table, backup_id),
            payload_sha256: sha256_hex(&payload),
            payload_size: payload.len() as u64,
            row_count: snapshot.rows.len() as u64,
            source_version: snapshot.version,
            writer_identity: self.writer_identity.clone(),
        };

        self.write_once(&record.payload_ref, Bytes::from(payload), retain_until)
            .await?;
        let meta = serde_json::to_vec(&record).map_err(Error::serialization)?;
        // The record object is the commit point of a snapshot.
        self.write_once(&record.record_path(), Bytes::from(meta), retain_until)
            .await?;

        self.write_index().insert(backup_id, record.clone());
        self.audit(
            AuditAction::SnapshotWrite,
            &self.writer_identity,
            &record.record_path(),
            reasons::SNAPSHOT,
            now,
        )
        .await?;

        tracing::info!(
            backup_id = %backup_id,
            rows = record.row_count,
            version = record.source_version,
            retention_until = %retain_until,
            "snapshot retained"
        );
        Ok(record)
    }

    async fn write_once(&self, path: &str, data: Bytes, retain_until: DateTime<Utc>) -> Result<()> {
        match self.storage.put_retained(path, data, retain_until).await? {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { current_version } => Err(Error::storage(format!(
                "retained object already exists at {path} (version {current_version})"
            ))),
        }
    }

    /// The record with `backup_id`.
    #[must_use]
    pub fn get(&self, backup_id: BackupId) -> Option<RetentionRecord> {
        self.read_index().get(&backup_id).cloned()
    }

    /// Records of `table` (or of every table), oldest first.
    #[must_use]
    pub fn list(&self, table: Option<&str>) -> Vec<RetentionRecord> {
        let mut records: Vec<RetentionRecord> = self
            .read_index()
            .values()
            .filter(|r| table.is_none_or(|t| r.source_table == t))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.snapshot_timestamp, a.backup_id).cmp(&(b.snapshot_timestamp, b.backup_id))
        });
        records
    }

    /// Reads a retained payload and checks it against its recorded digest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] for an unknown id and
    /// [`Error::IntegrityMismatch`] if the bytes changed.
    pub async fn read_payload(&self, backup_id: BackupId) -> Result<Bytes> {
        let record = self.require(backup_id)?;
        let payload = self.storage.get(&record.payload_ref).await?;
        let actual = sha256_hex(&payload);
        if actual != record.payload_sha256 {
            tracing::error!(backup_id = %backup_id, "retained payload digest mismatch");
            return Err(Error::IntegrityMismatch {
                backup_id,
                expected: record.payload_sha256,
                actual,
            });
        }
        Ok(payload)
    }

    /// Reads and decodes a retained snapshot.
    ///
    /// # Errors
    ///
    /// See [`read_payload`](Self::read_payload).
    pub async fn read_snapshot(&self, backup_id: BackupId) -> Result<TableSnapshot> {
        let payload = self.read_payload(backup_id).await?;
        serde_json::from_slice(&payload).map_err(Error::serialization)
    }

    /// Deletes an expired record and its payload.
    ///
    /// The decision is audited before anything else happens. The medium
    /// still refuses if its own lock has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetentionLocked`] while the record is locked.
    pub async fn delete(&self, backup_id: BackupId, caller: &str) -> Result<()> {
        let record = self.require(backup_id)?;
        let span = retention_span("delete", &record.source_table);
        async {
            let now = self.clock.now();
            let resource = record.record_path();
            if record.is_locked(now) {
                self.audit_refusal(
                    AuditAction::RetentionDeleteDeny,
                    caller,
                    &resource,
                    reasons::RETENTION_LOCKED,
                    now,
                )
                .await;
                return Err(Error::RetentionLocked {
                    backup_id,
                    retention_until: record.retention_until,
                });
            }

            self.audit(
                AuditAction::RetentionDeleteAllow,
                caller,
                &resource,
                reasons::EXPIRED,
                now,
            )
            .await?;
            self.storage.delete(&record.payload_ref).await?;
            self.storage.delete(&resource).await?;
            self.write_index().remove(&backup_id);
            tracing::info!(backup_id = %backup_id, caller, "expired snapshot deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Attempts to modify a record. Always refused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetentionLocked`] while the record is locked and
    /// [`Error::Immutable`] afterwards.
    pub async fn modify(&self, backup_id: BackupId, caller: &str) -> Result<()> {
        let record = self.require(backup_id)?;
        let now = self.clock.now();
        let locked = record.is_locked(now);
        let reason = if locked {
            reasons::RETENTION_LOCKED
        } else {
            reasons::IMMUTABLE
        };
        self.audit_refusal(
            AuditAction::RetentionModifyDeny,
            caller,
            &record.record_path(),
            reason,
            now,
        )
        .instrument(retention_span("modify", &record.source_table))
        .await;

        if locked {
            Err(Error::RetentionLocked {
                backup_id,
                retention_until: record.retention_until,
            })
        } else {
            Err(Error::Immutable { backup_id })
        }
    }

    fn require(&self, backup_id: BackupId) -> Result<RetentionRecord> {
        self.get(backup_id)
            .ok_or(Error::RecordNotFound { backup_id })
    }

    async fn audit(
        &self,
        action: AuditAction,
        actor: &str,
        resource: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let event = AuditEvent::builder()
            .action(action)
            .actor(actor)
            .resource(resource)
            .decision_reason(reason)
            .at(at)
            .try_build()
            .map_err(|e| Error::storage(format!("invalid audit event: {e}")))?;
        self.ledger.record(&event).await?;
        Ok(())
    }

    /// Audits a refusal. The refusal stands even if the ledger write fails.
    async fn audit_refusal(
        &self,
        action: AuditAction,
        actor: &str,
        resource: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) {
        if let Err(e) = self.audit(action, actor, resource, reason, at).await {
            tracing::error!(resource, error = %e, "failed to persist audit event");
        }
    }

    fn table_lock(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .table_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(table.to_string()).or_default())
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<BackupId, RetentionRecord>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<BackupId, RetentionRecord>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use tidemark_core::{ManualClock, MemoryBackend};

    #[derive(Debug)]
    struct OneTable;

    #[async_trait]
    impl SnapshotSource for OneTable {
        async fn read_table(&self, table: &str) -> Result<TableSnapshot> {
            if table != "claims" {
                return Err(Error::TableUnavailable {
                    table: table.to_string(),
                });
            }
            let mut snapshot = TableSnapshot {
                table: table.to_string(),
                version: 3,
                ..TableSnapshot::default()
            };
            let row = json!({"id": "c1", "amount": 120});
            if let serde_json::Value::Object(map) = row {
                snapshot.rows.insert("c1".to_string(), map);
            }
            Ok(snapshot)
        }
    }

    async fn store() -> (RetentionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let store = RetentionStore::open(backend, Arc::new(OneTable), "service:snapshotter")
            .await
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn snapshot_records_digest_and_deadline() {
        let (store, _clock) = store().await;
        let record = store.snapshot("claims").await.unwrap();
        assert_eq!(record.row_count, 1);
        assert_eq!(record.source_version, 3);
        assert_eq!(
            record.retention_until,
            Utc.with_ymd_and_hms(2032, 6, 1, 0, 0, 0).unwrap()
        );
        let payload = store.read_payload(record.backup_id).await.unwrap();
        assert_eq!(sha256_hex(&payload), record.payload_sha256);
    }

    #[tokio::test]
    async fn same_instant_snapshot_is_rejected() {
        let (store, clock) = store().await;
        store.snapshot("claims").await.unwrap();
        assert!(matches!(
            store.snapshot("claims").await,
            Err(Error::DuplicateSnapshot { .. })
        ));
        clock.advance(chrono::Duration::seconds(1));
        store.snapshot("claims").await.unwrap();
        assert_eq!(store.list(Some("claims")).len(), 2);
    }

    #[tokio::test]
    async fn unknown_table_writes_nothing() {
        let (store, _clock) = store().await;
        assert!(matches!(
            store.snapshot("nope").await,
            Err(Error::TableUnavailable { .. })
        ));
        assert!(store.list(None).is_empty());
    }
}
