//! Pipeline and service configuration.
//!
//! - [`PipelineConfig`]: what to materialize. A JSON document listing source
//!   tables, derived table definitions, compute tier profiles and the tables
//!   to snapshot for retention.
//! - [`ServiceConfig`]: how to run. Read from `TIDEMARK_*` environment
//!   variables by the service binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidemark_core::LogFormat;

use crate::error::{Error, Result};
use crate::registry::{DerivedTableSpec, TableRegistry};
use crate::tier::TierProfiles;
use crate::transform::TransformCatalog;
use crate::usage::AnomalyConfig;

/// The pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Source tables fed by the change stream.
    pub sources: Vec<String>,
    /// Derived table definitions.
    #[serde(default)]
    pub derived: Vec<DerivedTableSpec>,
    /// Compute tier profiles.
    #[serde(default)]
    pub tiers: TierProfiles,
    /// Curated tables snapshotted into retention.
    #[serde(default)]
    pub snapshot_tables: Vec<String>,
    /// Cost anomaly settings.
    #[serde(default)]
    pub anomaly: AnomalyConfig,
}

impl PipelineConfig {
    /// Parses a pipeline definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the JSON does not describe a pipeline.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid pipeline config: {e}")))
    }

    /// Reads a pipeline definition from a file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Validates the definition into a registry.
    ///
    /// # Errors
    ///
    /// See [`TableRegistry::build`]. Snapshot tables must be registered.
    pub fn registry(&self, catalog: &TransformCatalog) -> Result<TableRegistry> {
        let registry = TableRegistry::build(&self.sources, &self.derived, catalog)?;
        for table in &self.snapshot_tables {
            if !registry.contains(table) {
                return Err(Error::configuration(format!(
                    "snapshot table '{table}' is not defined"
                )));
            }
        }
        Ok(registry)
    }
}

/// Runtime settings of the scheduler service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Pipeline definition file.
    pub pipeline_config: PathBuf,
    /// Root directory for durable state and retained snapshots.
    pub data_dir: PathBuf,
    /// Scheduler tick interval.
    pub tick_interval: Duration,
    /// Log output format.
    pub log_format: LogFormat,
    /// Overrides the bulk tier slot count.
    pub bulk_slots: Option<usize>,
    /// Overrides the incremental tier slot count.
    pub incremental_slots: Option<usize>,
    /// Overrides the cost per compute unit on both tiers.
    pub cost_per_unit: Option<f64>,
    /// Retention snapshot interval.
    pub snapshot_interval: Duration,
    /// Identity recorded as the actor of retention writes.
    pub writer_identity: String,
    /// JSON-lines change feed replayed into the change stream at startup.
    pub feed_path: Option<PathBuf>,
}

impl ServiceConfig {
    /// Default tick interval.
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);
    /// Default snapshot interval (daily).
    pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Reads the configuration from `TIDEMARK_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `TIDEMARK_PIPELINE_CONFIG` or
    /// `TIDEMARK_DATA_DIR` is missing, or any variable fails to parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name).and_then(|v| {
                let trimmed = v.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| Error::configuration(format!("{name} is required")))
        };

        let log_format = match get("TIDEMARK_LOG_FORMAT") {
            Some(v) => v
                .parse::<LogFormat>()
                .map_err(|e| Error::configuration(format!("TIDEMARK_LOG_FORMAT: {e}")))?,
            None => LogFormat::default(),
        };

        let tick_interval =
            parse::<u64>("TIDEMARK_TICK_INTERVAL_SECS", get("TIDEMARK_TICK_INTERVAL_SECS"))?
                .map_or(Self::DEFAULT_TICK_INTERVAL, Duration::from_secs);
        let snapshot_interval =
            parse::<u64>("TIDEMARK_SNAPSHOT_INTERVAL_SECS", get("TIDEMARK_SNAPSHOT_INTERVAL_SECS"))?
                .map_or(Self::DEFAULT_SNAPSHOT_INTERVAL, Duration::from_secs);
        if tick_interval.is_zero() || snapshot_interval.is_zero() {
            return Err(Error::configuration("intervals must be greater than zero"));
        }

        let cost_per_unit = parse::<f64>("TIDEMARK_COST_PER_UNIT", get("TIDEMARK_COST_PER_UNIT"))?;
        if cost_per_unit.is_some_and(|c| !c.is_finite() || c < 0.0) {
            return Err(Error::configuration(
                "TIDEMARK_COST_PER_UNIT must be a non-negative number",
            ));
        }

        Ok(Self {
            pipeline_config: PathBuf::from(required("TIDEMARK_PIPELINE_CONFIG")?),
            data_dir: PathBuf::from(required("TIDEMARK_DATA_DIR")?),
            tick_interval,
            log_format,
            bulk_slots: parse("TIDEMARK_BULK_SLOTS", get("TIDEMARK_BULK_SLOTS"))?,
            incremental_slots: parse(
                "TIDEMARK_INCREMENTAL_SLOTS",
                get("TIDEMARK_INCREMENTAL_SLOTS"),
            )?,
            cost_per_unit,
            snapshot_interval,
            writer_identity: get("TIDEMARK_WRITER_IDENTITY")
                .unwrap_or_else(|| "tidemark-scheduler".to_string()),
            feed_path: get("TIDEMARK_FEED_PATH").map(PathBuf::from),
        })
    }

    /// Applies the service overrides to pipeline tier profiles.
    pub fn apply_tier_overrides(&self, tiers: &mut TierProfiles) {
        if let Some(slots) = self.bulk_slots {
            tiers.bulk.slots = slots;
        }
        if let Some(slots) = self.incremental_slots {
            tiers.incremental.slots = slots;
        }
        if let Some(cost) = self.cost_per_unit {
            tiers.bulk.cost_per_unit = cost;
            tiers.incremental.cost_per_unit = cost;
        }
    }
}

fn parse<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| Error::configuration(format!("{name}: {e}")))
        })
        .transpose()
}
