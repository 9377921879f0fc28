//! Published derived tables as a retention snapshot source.
//!
//! Snapshots read the published version only, so a retained payload is
//! always a whole committed refresh.

use async_trait::async_trait;

use tidemark_retention::{SnapshotSource, TableSnapshot};

use crate::materialize::PublishedTables;

#[async_trait]
impl SnapshotSource for PublishedTables {
    async fn read_table(&self, table: &str) -> tidemark_retention::Result<TableSnapshot> {
        let published = self
            .get(table)
            .ok_or_else(|| tidemark_retention::Error::TableUnavailable {
                table: table.to_string(),
            })?;
        Ok(TableSnapshot {
            table: table.to_string(),
            version: published.version(),
            rows: published
                .rows()
                .map(|(pk, row)| (pk.to_string(), row.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tidemark_core::MemoryBackend;
    use tidemark_retention::RetentionStore;

    use crate::row::row_of;
    use crate::table::{DerivedTable, RowChange, RowOp};

    fn paid_table() -> DerivedTable {
        let mut table = DerivedTable::new("paid");
        assert!(table.apply(&RowChange {
            primary_key: "o1".to_string(),
            op: RowOp::Upsert(row_of([("amount", json!(10))])),
            upstream: "orders".to_string(),
            sequence: 1,
        }));
        table.seal();
        table
    }

    #[tokio::test]
    async fn reads_the_published_version() {
        let published = PublishedTables::new();
        assert!(published.read_table("paid").await.is_err());

        published.publish(Arc::new(paid_table()));

        let snapshot = published.read_table("paid").await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.rows["o1"]["amount"], json!(10));
    }

    #[tokio::test]
    async fn retention_store_snapshots_shared_published_tables() {
        let published = Arc::new(PublishedTables::new());
        let source: Arc<dyn SnapshotSource> = published.clone();
        let store = RetentionStore::open(Arc::new(MemoryBackend::new()), source, "service:test")
            .await
            .unwrap();

        published.publish(Arc::new(paid_table()));
        let record = store.snapshot("paid").await.unwrap();
        assert_eq!(record.source_version, 1);
        assert_eq!(record.row_count, 1);
    }
}
