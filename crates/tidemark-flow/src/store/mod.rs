//! Durable state for the scheduler.
//!
//! The [`StateStore`] trait is the persistence layer for everything that must
//! survive a restart: per-table refresh state, published table data, and
//! Change Stream consumer offsets.
//!
//! ## Commit protocol
//!
//! A refresh writes its table data first (under a version nobody reads yet),
//! then commits the table state with compare-and-swap. The state write is the
//! single commit point: it carries the new watermarks and the published
//! version together, so a crash between the two writes leaves the previous
//! state, and the orphaned data object is simply overwritten by the next
//! refresh.

pub mod object;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::DerivedTableState;
use crate::table::DerivedTable;

pub use object::ObjectStateStore;

/// Result of a compare-and-swap state write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Write applied; carries the new version token.
    Success {
        /// Version token to pass as `expected` on the next write.
        version: String,
    },
    /// The stored state changed since it was read.
    VersionConflict {
        /// The version found, or `None` if the state no longer exists.
        actual: Option<String>,
    },
}

impl CasResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A table state together with its storage version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    /// The state.
    pub state: DerivedTableState,
    /// Opaque version token for compare-and-swap.
    pub version: String,
}

/// Storage abstraction for scheduler state.
///
/// All methods are `Send + Sync` so the store can be shared by the scheduler
/// and its in-flight refreshes.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Loads every stored table state.
    async fn load_states(&self) -> Result<Vec<StoredState>>;

    /// Loads one table state.
    async fn get_state(&self, table: &str) -> Result<Option<StoredState>>;

    /// Writes a table state if the stored version still equals `expected`
    /// (`None` means the state must not exist yet).
    async fn put_state(
        &self,
        state: &DerivedTableState,
        expected: Option<&str>,
    ) -> Result<CasResult>;

    /// Removes a retired table's state. Idempotent.
    async fn delete_state(&self, table: &str) -> Result<()>;

    /// Durably writes a table at its current version.
    async fn write_table(&self, table: &DerivedTable) -> Result<()>;

    /// Reads a table at `version`, if it was written.
    async fn read_table(&self, name: &str, version: u64) -> Result<Option<DerivedTable>>;

    /// Last saved offset of `consumer` on `stream` (0 if never saved).
    async fn load_offset(&self, stream: &str, consumer: &str) -> Result<u64>;

    /// Saves a consumer offset. Offsets never move backwards.
    async fn save_offset(&self, stream: &str, consumer: &str, offset: u64) -> Result<()>;
}

/// Storage paths used by [`ObjectStateStore`].
pub mod paths {
    /// Prefix of all table state objects.
    pub const STATE_PREFIX: &str = "state/tables/";

    /// Path of a table's state object.
    #[must_use]
    pub fn state(table: &str) -> String {
        format!("{STATE_PREFIX}{table}.json")
    }

    /// Path of a table's data at `version`.
    #[must_use]
    pub fn table_data(name: &str, version: u64) -> String {
        format!("tables/{name}/v{version:020}.json")
    }

    /// Path of a consumer offset.
    #[must_use]
    pub fn offset(stream: &str, consumer: &str) -> String {
        format!("state/offsets/{stream}/{consumer}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(
            CasResult::Success {
                version: "1".into()
            }
            .is_success()
        );
        assert!(!CasResult::VersionConflict { actual: None }.is_success());
    }

    #[test]
    fn table_paths_sort_by_version() {
        assert!(paths::table_data("t", 9) < paths::table_data("t", 10));
        assert_eq!(paths::state("clean"), "state/tables/clean.json");
    }
}
