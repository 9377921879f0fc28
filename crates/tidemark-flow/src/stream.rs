//! Per-source-table change streams.
//!
//! A [`ChangeStream`] is the append-only log of row mutations for one source
//! table, ordered by `source_sequence`. Consumers read with [`ChangeStream::poll`]
//! from their last committed offset and advance it with [`ChangeStream::commit`]
//! once the effects of a batch are durable downstream.
//!
//! ## Delivery
//!
//! The replication feed delivers at least once. An event whose sequence is at
//! or below the head but still inside the deduplication window is a
//! redelivery and is dropped as a duplicate. A sequence further behind the
//! head than the window can no longer be told apart from a lost event; it is
//! rejected with [`Error::OutOfOrder`].
//!
//! Each stream has its own lock; different source tables never contend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::row::Row;

/// Default number of sequences behind the head treated as redeliveries.
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// A new row.
    Insert,
    /// A change to an existing row (payload may be partial).
    Update,
    /// Removal of a row.
    Delete,
}

impl Operation {
    /// Returns the wire name of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One committed row mutation from a source table. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the mutation happened in.
    pub source_table: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Primary key of the mutated row, rendered as a string.
    pub primary_key: String,
    /// Column values carried by the event. Empty for deletes.
    #[serde(default)]
    pub payload: Row,
    /// Monotonic per-table sequence number; the sole ordering key.
    pub source_sequence: u64,
    /// Commit time at the source. Informational only.
    pub source_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        source_table: impl Into<String>,
        operation: Operation,
        primary_key: impl Into<String>,
        source_sequence: u64,
        payload: Row,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            operation,
            primary_key: primary_key.into(),
            payload,
            source_sequence,
            source_timestamp: Utc::now(),
        }
    }

    /// Creates an INSERT event.
    #[must_use]
    pub fn insert(table: impl Into<String>, pk: impl Into<String>, seq: u64, payload: Row) -> Self {
        Self::new(table, Operation::Insert, pk, seq, payload)
    }

    /// Creates an UPDATE event.
    #[must_use]
    pub fn update(table: impl Into<String>, pk: impl Into<String>, seq: u64, payload: Row) -> Self {
        Self::new(table, Operation::Update, pk, seq, payload)
    }

    /// Creates a DELETE event.
    #[must_use]
    pub fn delete(table: impl Into<String>, pk: impl Into<String>, seq: u64) -> Self {
        Self::new(table, Operation::Delete, pk, seq, Row::new())
    }

    /// Overrides the source timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = timestamp;
        self
    }
}

/// Outcome of appending an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was added to the log.
    Accepted,
    /// The event was a redelivery and was dropped.
    Duplicate,
}

/// A finite batch of events, ascending by sequence.
///
/// Polling again from the same offset yields the same batch (or a longer one),
/// so a consumer that crashes before committing simply re-polls.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    events: Vec<Arc<ChangeEvent>>,
}

impl ChangeBatch {
    /// Returns true if the batch holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Highest sequence in the batch.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.events.last().map(|e| e.source_sequence)
    }

    /// Iterates over the events.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter().map(AsRef::as_ref)
    }
}

impl IntoIterator for ChangeBatch {
    type Item = Arc<ChangeEvent>;
    type IntoIter = std::vec::IntoIter<Arc<ChangeEvent>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Lag of one consumer on one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerLag {
    /// Consumer name.
    pub consumer: String,
    /// Last committed sequence.
    pub committed: u64,
    /// Retained events above the committed offset.
    pub pending: usize,
}

/// Point-in-time report for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Source table.
    pub table: String,
    /// Highest accepted sequence.
    pub head: u64,
    /// Events currently retained in memory.
    pub retained: usize,
    /// True if any consumer is behind the head.
    pub has_unconsumed: bool,
    /// Per-consumer offsets, sorted by consumer name.
    pub consumers: Vec<ConsumerLag>,
}

#[derive(Debug, Default)]
struct StreamLog {
    events: VecDeque<Arc<ChangeEvent>>,
    head: u64,
    consumers: BTreeMap<String, u64>,
}

impl StreamLog {
    /// Index of the first retained event with `sequence > offset`.
    fn first_after(&self, offset: u64) -> usize {
        self.events.partition_point(|e| e.source_sequence <= offset)
    }

    fn pending_after(&self, offset: u64) -> usize {
        self.events.len() - self.first_after(offset)
    }
}

/// The ordered change log of one source table.
#[derive(Debug)]
pub struct ChangeStream {
    table: String,
    dedup_window: u64,
    log: Mutex<StreamLog>,
    appended: Notify,
}

impl ChangeStream {
    /// Creates an empty stream for `table` with the default deduplication window.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_dedup_window(table, DEFAULT_DEDUP_WINDOW)
    }

    /// Creates an empty stream dropping redeliveries up to `window` behind the head.
    #[must_use]
    pub fn with_dedup_window(table: impl Into<String>, window: usize) -> Self {
        Self {
            table: table.into(),
            dedup_window: u64::try_from(window.max(1)).unwrap_or(u64::MAX),
            log: Mutex::new(StreamLog::default()),
            appended: Notify::new(),
        }
    }

    /// Source table of this stream.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StreamLog>> {
        self.log
            .lock()
            .map_err(|_| Error::storage(format!("stream {} lock poisoned", self.table)))
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfOrder`] for a sequence more than the
    /// deduplication window behind the head, and a core `InvalidInput` error
    /// if the event belongs to another table or carries sequence 0.
    pub fn append(&self, event: ChangeEvent) -> Result<AppendOutcome> {
        if event.source_table != self.table {
            return Err(tidemark_core::Error::InvalidInput(format!(
                "event for {} appended to stream {}",
                event.source_table, self.table
            ))
            .into());
        }
        if event.source_sequence == 0 {
            return Err(tidemark_core::Error::InvalidInput(format!(
                "sequence 0 is reserved (stream {})",
                self.table
            ))
            .into());
        }

        let sequence = event.source_sequence;
        let mut log = self.lock()?;
        if sequence <= log.head {
            let within_window = sequence.saturating_add(self.dedup_window) > log.head;
            if within_window {
                return Ok(AppendOutcome::Duplicate);
            }
            return Err(Error::OutOfOrder {
                table: self.table.clone(),
                sequence,
                head: log.head,
            });
        }

        log.head = sequence;
        log.events.push_back(Arc::new(event));
        drop(log);

        self.appended.notify_waiters();
        Ok(AppendOutcome::Accepted)
    }

    /// Returns the sequence a replication adapter should assign next.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.lock()?.head + 1)
    }

    /// Highest accepted sequence (0 if none).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn head(&self) -> Result<u64> {
        Ok(self.lock()?.head)
    }

    /// Returns up to `max_batch` events with sequence greater than `offset`.
    ///
    /// Never blocks; an empty batch means nothing is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn poll(&self, offset: u64, max_batch: usize) -> Result<ChangeBatch> {
        let log = self.lock()?;
        let start = log.first_after(offset);
        let events = log
            .events
            .iter()
            .skip(start)
            .take(max_batch)
            .cloned()
            .collect();
        Ok(ChangeBatch { events })
    }

    /// Like [`poll`](Self::poll) but waits up to `timeout` for new events.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub async fn poll_wait(
        &self,
        offset: u64,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<ChangeBatch> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.poll(offset, max_batch)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }

    /// Registers a consumer at offset 0 if it is not known yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn register_consumer(&self, consumer: &str) -> Result<()> {
        self.lock()?
            .consumers
            .entry(consumer.to_string())
            .or_insert(0);
        Ok(())
    }

    /// Forgets a consumer so it no longer holds back truncation.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn unregister_consumer(&self, consumer: &str) -> Result<()> {
        self.lock()?.consumers.remove(consumer);
        Ok(())
    }

    /// Advances a consumer's offset. Lower offsets are ignored.
    ///
    /// Returns the offset in effect after the call. Persisting it is the
    /// caller's job; see `StateStore::save_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn commit(&self, consumer: &str, offset: u64) -> Result<u64> {
        let mut log = self.lock()?;
        let entry = log.consumers.entry(consumer.to_string()).or_insert(0);
        *entry = (*entry).max(offset);
        Ok(*entry)
    }

    /// Last committed offset of `consumer` (0 if unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn committed(&self, consumer: &str) -> Result<u64> {
        Ok(self.lock()?.consumers.get(consumer).copied().unwrap_or(0))
    }

    /// Drops retained events every registered consumer has committed.
    ///
    /// Returns the number of events dropped. Does nothing without consumers.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn truncate_committed(&self) -> Result<usize> {
        let mut log = self.lock()?;
        let Some(floor) = log.consumers.values().copied().min() else {
            return Ok(0);
        };
        let cut = log.first_after(floor);
        log.events.drain(..cut);
        Ok(cut)
    }

    /// Reports head, retention and consumer lag.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream lock is poisoned.
    pub fn status(&self) -> Result<StreamStatus> {
        let log = self.lock()?;
        let consumers: Vec<ConsumerLag> = log
            .consumers
            .iter()
            .map(|(consumer, &committed)| ConsumerLag {
                consumer: consumer.clone(),
                committed,
                pending: log.pending_after(committed),
            })
            .collect();
        Ok(StreamStatus {
            table: self.table.clone(),
            head: log.head,
            retained: log.events.len(),
            has_unconsumed: log.head > 0
                && (consumers.is_empty() || consumers.iter().any(|c| c.committed < log.head)),
            consumers,
        })
    }
}

/// Owns one [`ChangeStream`] per source table.
#[derive(Debug, Default)]
pub struct StreamHub {
    streams: RwLock<HashMap<String, Arc<ChangeStream>>>,
    dedup_window: Option<usize>,
    metrics: FlowMetrics,
}

impl StreamHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hub whose streams use a custom deduplication window.
    #[must_use]
    pub fn with_dedup_window(window: usize) -> Self {
        Self {
            dedup_window: Some(window),
            ..Self::default()
        }
    }

    /// Returns the stream for `table`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub lock is poisoned.
    pub fn register(&self, table: &str) -> Result<Arc<ChangeStream>> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| Error::storage("stream hub lock poisoned"))?;
        let stream = streams.entry(table.to_string()).or_insert_with(|| {
            Arc::new(ChangeStream::with_dedup_window(
                table,
                self.dedup_window.unwrap_or(DEFAULT_DEDUP_WINDOW),
            ))
        });
        Ok(Arc::clone(stream))
    }

    /// Returns the stream for `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if no stream is registered.
    pub fn stream(&self, table: &str) -> Result<Arc<ChangeStream>> {
        self.streams
            .read()
            .map_err(|_| Error::storage("stream hub lock poisoned"))?
            .get(table)
            .cloned()
            .ok_or_else(|| Error::UnknownTable {
                table: table.to_string(),
            })
    }

    /// Routes an event to its table's stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] for unregistered tables and whatever
    /// [`ChangeStream::append`] returns.
    pub fn append(&self, event: ChangeEvent) -> Result<AppendOutcome> {
        let table = event.source_table.clone();
        let stream = self.stream(&table)?;
        match stream.append(event) {
            Ok(outcome) => {
                let label = match outcome {
                    AppendOutcome::Accepted => "accepted",
                    AppendOutcome::Duplicate => "duplicate",
                };
                self.metrics.record_change_event(&table, label);
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_change_event(&table, "rejected");
                Err(e)
            }
        }
    }

    /// Reports every stream, sorted by table name.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn status(&self) -> Result<Vec<StreamStatus>> {
        let streams: Vec<Arc<ChangeStream>> = self
            .streams
            .read()
            .map_err(|_| Error::storage("stream hub lock poisoned"))?
            .values()
            .cloned()
            .collect();
        let mut report = streams
            .iter()
            .map(|s| s.status())
            .collect::<Result<Vec<_>>>()?;
        report.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::row::row_of;

    fn ins(seq: u64) -> ChangeEvent {
        ChangeEvent::insert("orders", format!("{seq}"), seq, row_of([("v", json!(seq))]))
    }

    #[test]
    fn append_accepts_increasing_sequences() {
        let stream = ChangeStream::new("orders");
        assert_eq!(stream.append(ins(1)).unwrap(), AppendOutcome::Accepted);
        assert_eq!(stream.append(ins(5)).unwrap(), AppendOutcome::Accepted);
        assert_eq!(stream.head().unwrap(), 5);
        assert_eq!(stream.next_sequence().unwrap(), 6);
    }

    #[test]
    fn redelivery_is_a_duplicate_not_an_error() {
        let stream = ChangeStream::new("orders");
        stream.append(ins(1)).unwrap();
        stream.append(ins(2)).unwrap();
        assert_eq!(stream.append(ins(1)).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(stream.poll(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn late_sequences_inside_window_are_dropped() {
        let stream = ChangeStream::with_dedup_window("orders", 2);
        stream.append(ins(10)).unwrap();
        stream.append(ins(11)).unwrap();
        stream.append(ins(13)).unwrap();
        assert_eq!(stream.append(ins(12)).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(stream.append(ins(13)).unwrap(), AppendOutcome::Duplicate);
        let seqs: Vec<u64> = stream
            .poll(0, 10)
            .unwrap()
            .iter()
            .map(|e| e.source_sequence)
            .collect();
        assert_eq!(seqs, vec![10, 11, 13]);
    }

    #[test]
    fn sequences_beyond_window_are_out_of_order() {
        let stream = ChangeStream::with_dedup_window("orders", 2);
        stream.append(ins(10)).unwrap();
        stream.append(ins(11)).unwrap();
        stream.append(ins(13)).unwrap();
        let err = stream.append(ins(4)).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { sequence: 4, head: 13, .. }));
        let err = stream.append(ins(11)).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { sequence: 11, head: 13, .. }));
        assert_eq!(stream.head().unwrap(), 13);
    }

    #[test]
    fn wrong_table_and_zero_sequence_are_rejected() {
        let stream = ChangeStream::new("orders");
        assert!(stream.append(ChangeEvent::delete("users", "1", 1)).is_err());
        assert!(stream.append(ChangeEvent::delete("orders", "1", 0)).is_err());
    }

    #[test]
    fn poll_is_ascending_bounded_and_restartable() {
        let stream = ChangeStream::new("orders");
        for seq in 1..=5 {
            stream.append(ins(seq)).unwrap();
        }
        let batch = stream.poll(2, 2).unwrap();
        let seqs: Vec<u64> = batch.iter().map(|e| e.source_sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(batch.last_sequence(), Some(4));

        let again: Vec<u64> = stream
            .poll(2, 2)
            .unwrap()
            .iter()
            .map(|e| e.source_sequence)
            .collect();
        assert_eq!(again, seqs);
        assert!(stream.poll(5, 10).unwrap().is_empty());
    }

    #[test]
    fn commit_is_monotone() {
        let stream = ChangeStream::new("orders");
        assert_eq!(stream.commit("c", 4).unwrap(), 4);
        assert_eq!(stream.commit("c", 2).unwrap(), 4);
        assert_eq!(stream.committed("c").unwrap(), 4);
        assert_eq!(stream.committed("other").unwrap(), 0);
    }

    #[test]
    fn truncate_respects_slowest_consumer() {
        let stream = ChangeStream::new("orders");
        for seq in 1..=6 {
            stream.append(ins(seq)).unwrap();
        }
        stream.commit("fast", 6).unwrap();
        stream.commit("slow", 2).unwrap();
        assert_eq!(stream.truncate_committed().unwrap(), 2);
        assert_eq!(stream.poll(0, 100).unwrap().len(), 4);

        let status = stream.status().unwrap();
        assert!(status.has_unconsumed);
        assert_eq!(status.consumers[1].consumer, "slow");
        assert_eq!(status.consumers[1].pending, 4);
    }

    #[tokio::test]
    async fn poll_wait_returns_when_data_arrives() {
        let stream = Arc::new(ChangeStream::new("orders"));
        let writer = Arc::clone(&stream);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(ins(1)).unwrap();
        });
        let batch = stream
            .poll_wait(0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn poll_wait_times_out_empty() {
        let stream = ChangeStream::new("orders");
        let batch = stream
            .poll_wait(0, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn hub_routes_and_reports() {
        let hub = StreamHub::new();
        hub.register("orders").unwrap();
        hub.register("customers").unwrap();
        hub.append(ins(1)).unwrap();
        assert!(matches!(
            hub.append(ChangeEvent::delete("nope", "1", 1)),
            Err(Error::UnknownTable { .. })
        ));
        let report = hub.status().unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].table, "customers");
        assert_eq!(report[1].head, 1);
    }
}
