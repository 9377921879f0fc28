//! Retention audit trail.
//!
//! Every decision taken on a retained object (write, delete allowed, delete or
//! modify refused) becomes an [`AuditEvent`]. Events go to two places:
//!
//! 1. An [`AuditSink`] (structured logs on the `audit` tracing target by default)
//! 2. The [`AuditLedger`], which persists each event as its own write-once
//!    object under `audit/{date}/{timestamp}-{event_id}.json`
//!
//! Refusals are recorded *before* the error is returned to the caller.
//!
//! ## Usage
//!
//! ```rust
//! use tidemark_core::audit::{AuditAction, AuditEvent};
//!
//! let event = AuditEvent::builder()
//!     .action(AuditAction::RetentionDeleteDeny)
//!     .actor("service:cleanup")
//!     .resource("retention/orders/01J0000000000000000000000.json")
//!     .decision_reason("retention_locked")
//!     .try_build()
//!     .unwrap();
//!
//! assert!(event.action.is_deny());
//! ```

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::EventId;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Version of the audit event schema.
pub const AUDIT_EVENT_VERSION: u32 = 1;

/// Prefix under which the ledger stores events.
pub const AUDIT_PREFIX: &str = "audit/";

/// Retention decisions that are audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum AuditAction {
    /// A new retained snapshot was written.
    SnapshotWrite,
    /// Deletion of an expired record was allowed.
    RetentionDeleteAllow,
    /// Deletion was refused because the record is still locked.
    RetentionDeleteDeny,
    /// Modification was refused.
    RetentionModifyDeny,
}

impl AuditAction {
    /// Returns true if this is a denial action.
    #[must_use]
    pub const fn is_deny(&self) -> bool {
        matches!(self, Self::RetentionDeleteDeny | Self::RetentionModifyDeny)
    }

    /// Returns the category of this action for grouping.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::SnapshotWrite => "snapshot",
            Self::RetentionDeleteAllow | Self::RetentionDeleteDeny => "delete",
            Self::RetentionModifyDeny => "modify",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SnapshotWrite => "SNAPSHOT_WRITE",
            Self::RetentionDeleteAllow => "RETENTION_DELETE_ALLOW",
            Self::RetentionDeleteDeny => "RETENTION_DELETE_DENY",
            Self::RetentionModifyDeny => "RETENTION_MODIFY_DENY",
        };
        write!(f, "{s}")
    }
}

/// An audited retention decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Schema version for evolution.
    pub event_version: u32,

    /// Unique event identifier.
    pub event_id: EventId,

    /// When the decision was taken (UTC).
    pub timestamp: DateTime<Utc>,

    /// Caller identity, e.g. `"service:snapshotter"` or `"user:ops"`.
    pub actor: String,

    /// The decision taken.
    pub action: AuditAction,

    /// Object or record the decision applies to.
    pub resource: String,

    /// Machine-readable reason (`retention_locked`, `expired`, `immutable`, ...).
    pub decision_reason: String,
}

impl AuditEvent {
    /// Creates a new builder for constructing audit events.
    #[must_use]
    pub fn builder() -> AuditEventBuilder {
        AuditEventBuilder::default()
    }

    /// Returns the ledger path for this event.
    #[must_use]
    pub fn ledger_path(&self) -> String {
        format!(
            "{AUDIT_PREFIX}{}/{}-{}.json",
            self.timestamp.format("%Y-%m-%d"),
            self.timestamp.format("%H%M%S%.6f"),
            self.event_id
        )
    }
}

/// Error type for audit event validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditValidationError {
    /// A required field is missing.
    #[error("audit event missing required field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
}

/// Builder for constructing [`AuditEvent`] instances.
#[derive(Debug, Default)]
pub struct AuditEventBuilder {
    action: Option<AuditAction>,
    actor: Option<String>,
    resource: Option<String>,
    decision_reason: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl AuditEventBuilder {
    /// Sets the action for this event.
    #[must_use]
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Sets the actor identity.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the resource the decision applies to.
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Sets the decision reason.
    #[must_use]
    pub fn decision_reason(mut self, reason: impl Into<String>) -> Self {
        self.decision_reason = Some(reason.into());
        self
    }

    /// Sets the decision time. Defaults to the wall clock.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the audit event.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing.
    pub fn try_build(self) -> std::result::Result<AuditEvent, AuditValidationError> {
        let missing = |field: &str| AuditValidationError::MissingField {
            field: field.to_string(),
        };
        Ok(AuditEvent {
            event_version: AUDIT_EVENT_VERSION,
            event_id: EventId::generate(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            actor: self.actor.ok_or_else(|| missing("actor"))?,
            action: self.action.ok_or_else(|| missing("action"))?,
            resource: self.resource.ok_or_else(|| missing("resource"))?,
            decision_reason: self
                .decision_reason
                .ok_or_else(|| missing("decision_reason"))?,
        })
    }
}

/// Trait for audit event sinks.
///
/// Implementations should be lightweight and non-blocking.
pub trait AuditSink: Send + Sync {
    /// Emit an audit event.
    fn emit(&self, event: &AuditEvent);

    /// Flush any buffered events.
    fn flush(&self) {}
}

/// Audit sink that emits events via tracing on the `audit` target.
///
/// Denials are logged at WARN, everything else at INFO.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if event.action.is_deny() {
            tracing::warn!(
                target: "audit",
                event_id = %event.event_id,
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                decision_reason = %event.decision_reason,
                "retention_decision"
            );
        } else {
            tracing::info!(
                target: "audit",
                event_id = %event.event_id,
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                decision_reason = %event.decision_reason,
                "retention_decision"
            );
        }
    }
}

/// Test audit sink that captures events for assertions.
#[derive(Debug, Default)]
pub struct TestAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl TestAuditSink {
    /// Creates a new empty test sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Returns the number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Returns true if no events have been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds events by action type.
    #[must_use]
    pub fn find_by_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .filter(|e| e.action == action)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditSink for TestAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
    }
}

/// Append-only audit ledger persisted on the storage medium.
///
/// Each event is its own object written with `DoesNotExist`, so the ledger
/// can only grow. The sink sees the event before the write is attempted.
#[derive(Clone)]
pub struct AuditLedger {
    storage: Arc<dyn StorageBackend>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger").finish_non_exhaustive()
    }
}

impl AuditLedger {
    /// Creates a ledger writing to `storage` and mirroring to `sink`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, sink: Arc<dyn AuditSink>) -> Self {
        Self { storage, sink }
    }

    /// Creates a ledger mirroring to the tracing sink.
    #[must_use]
    pub fn with_tracing(storage: Arc<dyn StorageBackend>) -> Self {
        Self::new(storage, Arc::new(TracingAuditSink))
    }

    /// Records an event in the sink and on the medium.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or persisted.
    pub async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.sink.emit(event);

        let path = event.ledger_path();
        let json = serde_json::to_vec(event).map_err(Error::serialization)?;
        match self
            .storage
            .put(&path, Bytes::from(json), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::Internal {
                message: format!("audit ledger entry already exists: {path}"),
            }),
        }
    }

    /// Reads back every persisted event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or decoding fails.
    pub async fn events(&self) -> Result<Vec<AuditEvent>> {
        let mut events = Vec::new();
        for meta in self.storage.list(AUDIT_PREFIX).await? {
            let raw = self.storage.get(&meta.path).await?;
            let event: AuditEvent = serde_json::from_slice(&raw).map_err(Error::serialization)?;
            events.push(event);
        }
        events.sort_by(|a, b| (a.timestamp, a.event_id).cmp(&(b.timestamp, b.event_id)));
        Ok(events)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use chrono::TimeZone;

    fn deny_event() -> AuditEvent {
        AuditEvent::builder()
            .action(AuditAction::RetentionDeleteDeny)
            .actor("user:ops")
            .resource("retention/orders/x.json")
            .decision_reason("retention_locked")
            .at(Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap())
            .try_build()
            .expect("valid event")
    }

    #[test]
    fn test_audit_action_display_and_category() {
        assert_eq!(AuditAction::SnapshotWrite.to_string(), "SNAPSHOT_WRITE");
        assert_eq!(
            AuditAction::RetentionModifyDeny.to_string(),
            "RETENTION_MODIFY_DENY"
        );
        assert_eq!(AuditAction::RetentionDeleteAllow.category(), "delete");
        assert!(AuditAction::RetentionDeleteDeny.is_deny());
        assert!(!AuditAction::RetentionDeleteAllow.is_deny());
    }

    #[test]
    fn test_builder_missing_required_field() {
        let result = AuditEvent::builder()
            .action(AuditAction::SnapshotWrite)
            .resource("retention/orders/x.json")
            .decision_reason("scheduled")
            .try_build();

        assert!(matches!(
            result,
            Err(AuditValidationError::MissingField { field }) if field == "actor"
        ));
    }

    #[test]
    fn test_ledger_path_layout() {
        let event = deny_event();
        let path = event.ledger_path();
        assert!(path.starts_with("audit/2025-03-04/050607"));
        assert!(path.ends_with(&format!("-{}.json", event.event_id)));
    }

    #[test]
    fn test_event_schema_fields_present() {
        let json = serde_json::to_value(deny_event()).expect("serialize");
        let obj = json.as_object().expect("should be object");
        for key in [
            "eventVersion",
            "eventId",
            "timestamp",
            "actor",
            "action",
            "resource",
            "decisionReason",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_ledger_persists_and_mirrors() {
        let storage = Arc::new(MemoryBackend::new());
        let sink = Arc::new(TestAuditSink::new());
        let ledger = AuditLedger::new(storage.clone(), sink.clone());

        let event = deny_event();
        ledger.record(&event).await.expect("record");

        assert_eq!(sink.find_by_action(AuditAction::RetentionDeleteDeny).len(), 1);
        let persisted = ledger.events().await.expect("events");
        assert_eq!(persisted, vec![event]);
    }
}
