//! Strongly-typed identifiers for Tidemark entities.
//!
//! Identifiers are ULIDs: sortable by creation time, unique without
//! coordination, and distinct types so a refresh task ID can never be
//! passed where a backup ID is expected.
//!
//! # Example
//!
//! ```rust
//! use tidemark_core::id::{BackupId, TaskId};
//!
//! let task = TaskId::generate();
//! let backup = BackupId::generate();
//! assert_ne!(task.to_string(), backup.to_string());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

ulid_id!(
    /// Identifier of a single refresh task dispatched by the scheduler.
    TaskId,
    "task ID"
);

ulid_id!(
    /// Identifier of a retained snapshot in the WORM store.
    BackupId,
    "backup ID"
);

ulid_id!(
    /// Identifier of an audit event.
    EventId,
    "event ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn backup_ids_are_unique() {
        assert_ne!(BackupId::generate(), BackupId::generate());
    }

    #[test]
    fn invalid_id_names_the_kind() {
        let err = "nope".parse::<BackupId>().unwrap_err();
        assert!(err.to_string().contains("backup ID"));
    }
}
