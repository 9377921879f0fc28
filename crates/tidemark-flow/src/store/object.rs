//! [`StateStore`] over an object storage backend.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tidemark_core::{StorageBackend, WritePrecondition, WriteResult};

use super::{CasResult, StateStore, StoredState, paths};
use crate::error::{Error, Result};
use crate::state::DerivedTableState;
use crate::table::DerivedTable;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OffsetRecord {
    offset: u64,
}

/// Persists scheduler state as JSON objects.
#[derive(Clone)]
pub struct ObjectStateStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for ObjectStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStateStore").finish_non_exhaustive()
    }
}

impl ObjectStateStore {
    /// Creates a store on `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        match self.storage.get(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::serialization(format!("{path}: {e}"))),
            Err(tidemark_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Error::serialization)
}

#[async_trait]
impl StateStore for ObjectStateStore {
    async fn load_states(&self) -> Result<Vec<StoredState>> {
        let mut states = Vec::new();
        for meta in self.storage.list(paths::STATE_PREFIX).await? {
            let bytes = match self.storage.get(&meta.path).await {
                Ok(bytes) => bytes,
                Err(tidemark_core::Error::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let state: DerivedTableState = serde_json::from_slice(&bytes)
                .map_err(|e| Error::serialization(format!("{}: {e}", meta.path)))?;
            states.push(StoredState {
                state,
                version: meta.version,
            });
        }
        Ok(states)
    }

    async fn get_state(&self, table: &str) -> Result<Option<StoredState>> {
        let path = paths::state(table);
        let Some(meta) = self.storage.head(&path).await? else {
            return Ok(None);
        };
        let Some(state) = self.read_json::<DerivedTableState>(&path).await? else {
            return Ok(None);
        };
        Ok(Some(StoredState {
            state,
            version: meta.version,
        }))
    }

    async fn put_state(
        &self,
        state: &DerivedTableState,
        expected: Option<&str>,
    ) -> Result<CasResult> {
        let precondition = expected.map_or(WritePrecondition::DoesNotExist, |v| {
            WritePrecondition::MatchesVersion(v.to_string())
        });
        let result = self
            .storage
            .put(&paths::state(&state.table), to_bytes(state)?, precondition)
            .await?;
        Ok(match result {
            WriteResult::Success { version } => CasResult::Success { version },
            WriteResult::PreconditionFailed { current_version } => CasResult::VersionConflict {
                actual: (current_version != "0").then_some(current_version),
            },
        })
    }

    async fn delete_state(&self, table: &str) -> Result<()> {
        self.storage.delete(&paths::state(table)).await?;
        Ok(())
    }

    async fn write_table(&self, table: &DerivedTable) -> Result<()> {
        let path = paths::table_data(table.name(), table.version());
        self.storage
            .put(&path, to_bytes(table)?, WritePrecondition::None)
            .await?;
        Ok(())
    }

    async fn read_table(&self, name: &str, version: u64) -> Result<Option<DerivedTable>> {
        self.read_json(&paths::table_data(name, version)).await
    }

    async fn load_offset(&self, stream: &str, consumer: &str) -> Result<u64> {
        Ok(self
            .read_json::<OffsetRecord>(&paths::offset(stream, consumer))
            .await?
            .map_or(0, |r| r.offset))
    }

    async fn save_offset(&self, stream: &str, consumer: &str, offset: u64) -> Result<()> {
        if self.load_offset(stream, consumer).await? >= offset {
            return Ok(());
        }
        self.storage
            .put(
                &paths::offset(stream, consumer),
                to_bytes(&OffsetRecord { offset })?,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }
}
