//! # tidemark-flow
//!
//! Change ingestion, incremental materialization and refresh scheduling for
//! Tidemark derived tables.
//!
//! This crate provides:
//!
//! - **Change Streams**: ordered, de-duplicated per-table change logs with
//!   consumer offsets ([`stream`])
//! - **Incremental Materialization**: applies change batches to derived tables
//!   and publishes whole versions only ([`materialize`])
//! - **Dual-Tier Compute**: bulk for backfills and forced recomputes,
//!   incremental for everything else ([`tier`], [`selector`])
//! - **Dependency Scheduling**: target-lag staleness, topological dispatch,
//!   retry backoff and operator controls ([`scheduler`])
//! - **Usage Monitoring**: per-refresh cost samples and anomaly alerts
//!   ([`usage`], [`alert`])
//!
//! ## Core Concepts
//!
//! - **Source table**: written by the application; every mutation becomes a
//!   change event with a per-table sequence number
//! - **Derived table**: defined over sources or other derived tables by a
//!   transform, and kept within a target lag of its upstreams
//! - **Watermark**: the last sequence (or upstream version) a derived table
//!   has consumed
//!
//! ## Guarantees
//!
//! - **Exactly-once effect**: redelivered events never change a table twice
//! - **Atomic publish**: readers see the old or the new version, never a mix
//! - **Upstream first**: a table is refreshed only against ready upstreams
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tidemark_flow::prelude::*;
//!
//! # fn main() -> tidemark_flow::error::Result<()> {
//! let derived = vec![
//!     DerivedTableSpec::new("clean_orders", &["orders"], Duration::from_secs(300)),
//!     DerivedTableSpec::new("daily_revenue", &["clean_orders"], Duration::from_secs(3600)),
//! ];
//! let registry = TableRegistry::build(
//!     &["orders".to_string()],
//!     &derived,
//!     &TransformCatalog::new(),
//! )?;
//! assert_eq!(registry.refresh_order(), ["clean_orders", "daily_revenue"]);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod alert;
pub mod config;
pub mod error;
pub mod materialize;
pub mod metrics;
pub mod registry;
pub mod row;
pub mod scheduler;
pub mod selector;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod store;
pub mod stream;
pub mod table;
pub mod tier;
pub mod transform;
pub mod usage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::alert::{Alert, AlertKind, AlertSink, InMemoryAlertSink, LedgerAlertSink};
    pub use crate::config::{PipelineConfig, ServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::materialize::{Materializer, PublishedTables, RefreshTask};
    pub use crate::metrics::FlowMetrics;
    pub use crate::registry::{DerivedTableSpec, TableRegistry};
    pub use crate::row::{Row, row_of};
    pub use crate::scheduler::{Scheduler, SchedulerDeps, TickReport};
    pub use crate::selector::select_tier;
    pub use crate::source::{InMemorySource, SourceReader};
    pub use crate::state::{DerivedTableState, RefreshReason, TableStatus};
    pub use crate::store::{ObjectStateStore, StateStore};
    pub use crate::stream::{ChangeEvent, ChangeStream, Operation, StreamHub};
    pub use crate::table::DerivedTable;
    pub use crate::tier::{ComputeTier, TierPool, TierProfile, TierProfiles};
    pub use crate::transform::{Transform, TransformCatalog, TransformSpec};
    pub use crate::usage::{AnomalyAlert, UsageMonitor, UsageSample};
}
