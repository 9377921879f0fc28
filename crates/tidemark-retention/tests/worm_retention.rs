//! Retention immutability across both enforcement layers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};

use tidemark_core::audit::TestAuditSink;
use tidemark_core::{
    AuditAction, Clock, FileBackend, ManualClock, MemoryBackend, StorageBackend,
    WritePrecondition,
};
use tidemark_retention::{
    ColumnMaskRedactor, Error, ResearchExport, RetentionStore, SnapshotRow, SnapshotSchedule,
    SnapshotSource, TableSnapshot,
};

#[derive(Debug, Default)]
struct Curated {
    tables: Mutex<BTreeMap<String, TableSnapshot>>,
}

impl Curated {
    fn put(&self, table: &str, version: u64, rows: &[(&str, Value)]) {
        let rows = rows
            .iter()
            .map(|(pk, row)| {
                let Value::Object(map) = row.clone() else {
                    panic!("row must be an object");
                };
                ((*pk).to_string(), map)
            })
            .collect::<BTreeMap<String, SnapshotRow>>();
        self.tables.lock().unwrap().insert(
            table.to_string(),
            TableSnapshot {
                table: table.to_string(),
                version,
                rows,
            },
        );
    }
}

#[async_trait]
impl SnapshotSource for Curated {
    async fn read_table(&self, table: &str) -> tidemark_retention::Result<TableSnapshot> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::TableUnavailable {
                table: table.to_string(),
            })
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap()
}

struct Harness {
    clock: Arc<ManualClock>,
    backend: Arc<dyn StorageBackend>,
    source: Arc<Curated>,
    audit: Arc<TestAuditSink>,
    store: RetentionStore,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let source = Arc::new(Curated::default());
    source.put(
        "claims_curated",
        7,
        &[
            ("c1", json!({"patient": "Ada", "amount": 120})),
            ("c2", json!({"patient": "Grace", "amount": 80})),
        ],
    );
    let audit = Arc::new(TestAuditSink::new());
    let store = RetentionStore::open(backend.clone(), source.clone(), "service:snapshotter")
        .await
        .unwrap()
        .with_clock(clock.clone())
        .with_audit_sink(audit.clone());
    Harness {
        clock,
        backend,
        source,
        audit,
        store,
    }
}

#[tokio::test]
async fn locked_record_refuses_delete_and_modify_for_any_caller() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();

    for caller in ["user:ops", "service:admin", "root"] {
        let err = h.store.delete(record.backup_id, caller).await.unwrap_err();
        assert!(matches!(err, Error::RetentionLocked { .. }), "{err}");
        let err = h.store.modify(record.backup_id, caller).await.unwrap_err();
        assert!(matches!(err, Error::RetentionLocked { .. }), "{err}");
    }

    h.clock.advance(Duration::days(365 * 6));
    assert!(h.store.delete(record.backup_id, "user:ops").await.is_err());
    assert!(h.store.get(record.backup_id).is_some());
}

#[tokio::test]
async fn refusals_are_audited_before_they_are_returned() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();
    h.clock.advance(Duration::seconds(1));
    h.store
        .delete(record.backup_id, "user:mallory")
        .await
        .unwrap_err();

    let denies = h.audit.find_by_action(AuditAction::RetentionDeleteDeny);
    assert_eq!(denies.len(), 1);
    assert_eq!(denies[0].actor, "user:mallory");
    assert_eq!(denies[0].decision_reason, "retention_locked");
    assert_eq!(denies[0].resource, record.record_path());

    let persisted = h.store.ledger().events().await.unwrap();
    let actions: Vec<_> = persisted.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::SnapshotWrite, AuditAction::RetentionDeleteDeny]
    );
}

#[tokio::test]
async fn expiry_permits_deletion_but_never_deletes_by_itself() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();

    h.clock.set(record.retention_until + Duration::seconds(1));
    assert!(h.store.get(record.backup_id).is_some());
    assert!(h.backend.head(&record.payload_ref).await.unwrap().is_some());

    let err = h.store.modify(record.backup_id, "user:ops").await.unwrap_err();
    assert!(matches!(err, Error::Immutable { .. }));

    h.store.delete(record.backup_id, "user:ops").await.unwrap();
    assert!(h.store.get(record.backup_id).is_none());
    assert!(h.backend.head(&record.payload_ref).await.unwrap().is_none());
    assert_eq!(
        h.audit
            .find_by_action(AuditAction::RetentionDeleteAllow)
            .len(),
        1
    );
}

#[tokio::test]
async fn medium_enforces_the_lock_without_the_logical_layer() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();

    // Bypass the store entirely.
    let err = h.backend.delete(&record.payload_ref).await.unwrap_err();
    assert!(matches!(err, tidemark_core::Error::RetentionLocked { .. }));
    let err = h
        .backend
        .put(
            &record.record_path(),
            Bytes::from_static(b"{}"),
            WritePrecondition::None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, tidemark_core::Error::RetentionLocked { .. }));
}

#[tokio::test]
async fn medium_refuses_even_when_the_store_clock_is_wrong() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();

    // A store whose clock claims the lock expired, over a medium that disagrees.
    let skewed = Arc::new(ManualClock::new(
        record.retention_until + Duration::days(1),
    ));
    let store = RetentionStore::open(h.backend.clone(), h.source.clone(), "service:rogue")
        .await
        .unwrap()
        .with_clock(skewed);

    let err = store.delete(record.backup_id, "service:rogue").await.unwrap_err();
    assert!(err.is_retention_locked(), "{err}");
    assert!(matches!(
        err,
        Error::Core(tidemark_core::Error::RetentionLocked { .. })
    ));
    assert!(h.backend.head(&record.payload_ref).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_snapshots_of_one_table_serialize() {
    let h = harness().await;
    let (a, b) = tokio::join!(
        h.store.snapshot("claims_curated"),
        h.store.snapshot("claims_curated")
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(Error::DuplicateSnapshot { .. })))
    );
    assert_eq!(h.store.list(Some("claims_curated")).len(), 1);
}

#[tokio::test]
async fn index_is_rebuilt_from_the_medium() {
    let h = harness().await;
    let first = h.store.snapshot("claims_curated").await.unwrap();
    h.clock.advance(Duration::days(1));
    let second = h.store.snapshot("claims_curated").await.unwrap();

    let reopened = RetentionStore::open(h.backend.clone(), h.source.clone(), "service:snapshotter")
        .await
        .unwrap();
    let ids: Vec<_> = reopened
        .list(Some("claims_curated"))
        .into_iter()
        .map(|r| r.backup_id)
        .collect();
    assert_eq!(ids, vec![first.backup_id, second.backup_id]);
    assert_eq!(reopened.get(first.backup_id), Some(first));
}

#[tokio::test]
async fn tampered_payload_fails_integrity_check() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let backend: Arc<dyn StorageBackend> =
        Arc::new(FileBackend::with_clock(dir.path(), clock.clone()));
    let source = Arc::new(Curated::default());
    source.put("claims_curated", 1, &[("c1", json!({"amount": 5}))]);
    let store = RetentionStore::open(backend, source, "service:snapshotter")
        .await
        .unwrap()
        .with_clock(clock.clone());

    let record = store.snapshot("claims_curated").await.unwrap();
    store.read_payload(record.backup_id).await.unwrap();

    // Out-of-band edit of the stored bytes.
    let on_disk = dir.path().join("objects").join(&record.payload_ref);
    tokio::fs::write(&on_disk, br#"{"table":"claims_curated","version":1,"rows":{}}"#)
        .await
        .unwrap();

    let err = store.read_payload(record.backup_id).await.unwrap_err();
    assert!(matches!(err, Error::IntegrityMismatch { .. }));
}

#[tokio::test]
async fn research_export_redacts_without_touching_the_record() {
    let h = harness().await;
    let record = h.store.snapshot("claims_curated").await.unwrap();

    let redactor = ColumnMaskRedactor::new(["patient"]);
    let export = ResearchExport::from_record(&h.store, record.backup_id, &redactor)
        .await
        .unwrap();
    assert_eq!(export.rows.len(), 2);
    assert!(export.rows.values().all(|r| r["patient"] == json!("REDACTED")));
    assert!(!export.rows.contains_key("c1"));
    assert_eq!(export.to_json_lines().unwrap().lines().count(), 2);

    let original = h.store.read_snapshot(record.backup_id).await.unwrap();
    assert_eq!(original.rows["c1"]["patient"], json!("Ada"));
}

#[tokio::test]
async fn schedule_pass_reports_failures_per_table() {
    let h = harness().await;
    let store = Arc::new(h.store);
    let schedule = SnapshotSchedule::new(
        store.clone(),
        vec!["claims_curated".to_string(), "missing".to_string()],
    );
    assert_eq!(schedule.tables().len(), 2);

    let run = schedule.run_once().await;
    assert_eq!(run.taken.len(), 1);
    assert_eq!(run.failed.len(), 1);
    assert_eq!(run.failed[0].0, "missing");

    h.clock.advance(Duration::days(1));
    let run = schedule.run_once().await;
    assert_eq!(run.taken.len(), 1);
    assert_eq!(store.list(None).len(), 2);
    assert!(h.clock.now() > start());
}
