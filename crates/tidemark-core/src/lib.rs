//! # tidemark-core
//!
//! Core primitives shared by every Tidemark component:
//!
//! - **Identifiers**: strongly-typed ULIDs for refresh tasks, backups and audit events
//! - **Clock**: injectable time source so staleness and retention are testable
//! - **Storage**: object storage contract with conditional writes and retention locks
//! - **Audit**: retention decision events, sinks and the persisted ledger
//! - **Observability**: logging initialisation and span helpers
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use tidemark_core::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let task = TaskId::generate();
//! # let _ = (backend, task);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod clock;
pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::{BackupId, EventId, TaskId};
    pub use crate::storage::{
        FileBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use audit::{AuditAction, AuditEvent, AuditLedger, AuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{BackupId, EventId, TaskId};
pub use observability::{LogFormat, init_logging, refresh_span, retention_span};
pub use storage::{
    FileBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
