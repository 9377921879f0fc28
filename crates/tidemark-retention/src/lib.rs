//! # tidemark-retention
//!
//! Write-once-read-many retention of curated table snapshots.
//!
//! - **Retention Store**: immutable snapshot records kept for seven years,
//!   with retention checked by the store and enforced again by the medium
//! - **Snapshot Schedule**: periodic snapshots, independent of refreshes
//! - **Integrity**: every payload carries its SHA-256 and is verified on read
//! - **Research Export**: de-identified copies of retained snapshots
//!
//! Every retention decision is audited to the persisted ledger before a
//! refusal is returned.
//!
//! ## Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tidemark_retention::record::retention_until;
//!
//! let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
//! let until = retention_until(at).unwrap();
//! assert_eq!(until, Utc.with_ymd_and_hms(2032, 1, 1, 0, 0, 0).unwrap());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod export;
pub mod record;
pub mod schedule;
pub mod source;
pub mod store;

pub use error::{Error, Result};
pub use export::{ColumnMaskRedactor, Redactor, ResearchExport};
pub use record::RetentionRecord;
pub use schedule::{SnapshotRun, SnapshotSchedule};
pub use source::{SnapshotRow, SnapshotSource, TableSnapshot};
pub use store::RetentionStore;
