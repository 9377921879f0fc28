//! Operator alerts.
//!
//! Two things page an operator: a derived table that moved to FAILED, and a
//! compute cost anomaly. Alerts are advisory; raising one never changes
//! scheduling. Delivery goes through an [`AlertSink`] so the notification
//! channel stays outside the core.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::{EventId, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::usage::AnomalyAlert;

/// How urgently an alert needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth a look.
    Warning,
    /// A table stopped refreshing.
    Critical,
}

/// What the alert is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// A refresh hit a non-retryable error; the table is FAILED.
    RefreshFailed {
        /// The failed table.
        table: String,
        /// Error description.
        message: String,
    },
    /// Rolling cost of a tier exceeded its baseline.
    CostAnomaly(AnomalyAlert),
}

/// One alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id.
    pub id: EventId,
    /// When the condition was detected.
    pub raised_at: DateTime<Utc>,
    /// Urgency.
    pub severity: Severity,
    /// Details.
    #[serde(flatten)]
    pub kind: AlertKind,
}

impl Alert {
    /// Alert for a table that moved to FAILED.
    #[must_use]
    pub fn refresh_failed(
        table: impl Into<String>,
        message: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            raised_at,
            severity: Severity::Critical,
            kind: AlertKind::RefreshFailed {
                table: table.into(),
                message: message.into(),
            },
        }
    }

    /// Alert for a cost anomaly.
    #[must_use]
    pub fn cost_anomaly(anomaly: AnomalyAlert, raised_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            raised_at,
            severity: Severity::Warning,
            kind: AlertKind::CostAnomaly(anomaly),
        }
    }

    /// Table or tier the alert is about.
    #[must_use]
    pub fn subject(&self) -> String {
        match &self.kind {
            AlertKind::RefreshFailed { table, .. } => table.clone(),
            AlertKind::CostAnomaly(anomaly) => anomaly.tier.to_string(),
        }
    }
}

/// Delivers alerts to an external notification channel.
#[async_trait]
pub trait AlertSink: Send + Sync + std::fmt::Debug {
    /// Delivers one alert.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert could not be delivered.
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Collects alerts in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl InMemoryAlertSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns all alerts in arrival order.
    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

/// Logs alerts on the `alert` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match &alert.kind {
            AlertKind::RefreshFailed { table, message } => tracing::error!(
                target: "alert",
                alert_id = %alert.id,
                table = %table,
                message = %message,
                "derived table failed"
            ),
            AlertKind::CostAnomaly(anomaly) => tracing::warn!(
                target: "alert",
                alert_id = %alert.id,
                tier = %anomaly.tier,
                window_cost = anomaly.window_cost,
                baseline_mean = anomaly.baseline_mean,
                ratio = anomaly.ratio,
                z_score = anomaly.z_score,
                "compute cost anomaly"
            ),
        }
        Ok(())
    }
}

/// Appends alerts to storage as JSON objects.
///
/// Alerts are written to `alerts/{date}/{timestamp}-{alert_id}.json`, with
/// `date` as `YYYY-MM-DD` (UTC) for listing by day.
#[derive(Clone)]
pub struct LedgerAlertSink {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for LedgerAlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAlertSink").finish_non_exhaustive()
    }
}

impl LedgerAlertSink {
    /// Creates a sink writing to `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Storage path of `alert`.
    #[must_use]
    pub fn path_for(alert: &Alert) -> String {
        format!(
            "alerts/{}/{}-{}.json",
            alert.raised_at.format("%Y-%m-%d"),
            alert.raised_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            alert.id
        )
    }
}

#[async_trait]
impl AlertSink for LedgerAlertSink {
    #[tracing::instrument(skip(self, alert), fields(alert_id = %alert.id, path = tracing::field::Empty))]
    async fn send(&self, alert: &Alert) -> Result<()> {
        let path = Self::path_for(alert);
        tracing::Span::current().record("path", tracing::field::display(&path));

        let json = serde_json::to_vec(alert)
            .map_err(|e| Error::serialization(format!("failed to serialize alert: {e}")))?;
        let result = self
            .storage
            .put(&path, Bytes::from(json), WritePrecondition::DoesNotExist)
            .await?;

        match result {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { current_version } => Err(Error::storage(format!(
                "alert already exists at {path} (version {current_version})"
            ))),
        }
    }
}
