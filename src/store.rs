//! The durable-store collaborator contract and the persistor that chunks
//! a routed batch into it, one atomic transaction per commit, then tells
//! the rest of the engine which subscriptions just received data.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::errors::ReplicationResult;
use crate::notify::PipelineNotifier;
use crate::router::{ConsumerEvent, ConsumerRecord, RoutedBatch, WalEvent};
use crate::status::StatusRegistry;

/// Batches larger than this are split into multiple `transact` calls of
/// this size.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// The durable store for consumer messages and pipeline events, owned
/// entirely by the caller. All four writes plus the `last_processed_seq`
/// update for one committed transaction must compose atomically.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn transact(&self, batch: EventBatch) -> ReplicationResult<usize>;
}

/// One atomic unit of work: everything the persistor derived from a single
/// committed source transaction.
pub struct EventBatch {
    pub slot_id: String,
    pub up_to_seq: u64,
    pub consumer_events: Vec<ConsumerEvent>,
    pub consumer_records: Vec<ConsumerRecord>,
    pub consumer_deletes: Vec<ConsumerRecord>,
    pub wal_events: Vec<WalEvent>,
}

/// Chunks a [`RoutedBatch`] into ≤ [`MAX_BATCH_SIZE`]-sized pieces per kind
/// and commits them through the configured [`EventStore`]. Once a batch
/// has committed it publishes a `wal_event_inserted` notification per
/// touched pipeline and marks every touched consumer/pipeline healthy.
pub struct Persistor<S: EventStore> {
    store: S,
    status: Option<Arc<StatusRegistry>>,
    notifier: Option<PipelineNotifier>,
}

impl<S: EventStore> Persistor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            status: None,
            notifier: None,
        }
    }

    /// Wire in the status registry and pipeline notifier so successful
    /// commits mark subscriptions healthy and publish `wal_event_inserted`.
    /// Without this, `persist` still commits and returns the row count but
    /// skips both side effects — used by tests that don't care about them.
    pub fn with_notifications(
        store: S,
        status: Arc<StatusRegistry>,
        notifier: PipelineNotifier,
    ) -> Self {
        Self {
            store,
            status: Some(status),
            notifier: Some(notifier),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist one committed transaction's routed batch. Returns the total
    /// row count on success. On failure the caller must not advance the
    /// LSN cursor; the source transaction will be redelivered on reconnect.
    pub async fn persist(
        &self,
        slot_id: &str,
        up_to_seq: u64,
        batch: RoutedBatch,
    ) -> ReplicationResult<usize> {
        let touched_pipelines: HashSet<Uuid> =
            batch.wal_events.iter().map(|e| e.pipeline_id).collect();
        let touched_consumers: HashSet<Uuid> = batch
            .consumer_events
            .iter()
            .map(|e| e.consumer_id)
            .chain(batch.consumer_records.iter().map(consumer_record_id))
            .chain(batch.consumer_deletes.iter().map(consumer_record_id))
            .collect();

        let mut total = 0;
        for chunk in chunk_batch(batch, up_to_seq, slot_id) {
            total += self.store.transact(chunk).await?;
        }
        info!(slot_id, up_to_seq, total, "persisted transaction batch");

        if let Some(notifier) = &self.notifier {
            for pipeline_id in &touched_pipelines {
                notifier.notify(*pipeline_id);
            }
        }
        if let Some(status) = &self.status {
            for id in touched_consumers.into_iter().chain(touched_pipelines) {
                status.mark_subscription_healthy(id);
            }
        }

        Ok(total)
    }
}

fn consumer_record_id(record: &ConsumerRecord) -> Uuid {
    match record {
        ConsumerRecord::Upsert { consumer_id, .. } => *consumer_id,
        ConsumerRecord::Delete { consumer_id, .. } => *consumer_id,
    }
}

fn chunk_batch(batch: RoutedBatch, up_to_seq: u64, slot_id: &str) -> Vec<EventBatch> {
    let RoutedBatch {
        consumer_events,
        consumer_records,
        consumer_deletes,
        wal_events,
    } = batch;

    let chunk_count = [
        consumer_events.len(),
        consumer_records.len(),
        consumer_deletes.len(),
        wal_events.len(),
    ]
    .into_iter()
    .map(|len| len.div_ceil(MAX_BATCH_SIZE).max(1))
    .max()
    .unwrap_or(1);

    let mut event_chunks = chunk_vec(consumer_events, chunk_count);
    let mut record_chunks = chunk_vec(consumer_records, chunk_count);
    let mut delete_chunks = chunk_vec(consumer_deletes, chunk_count);
    let mut wal_chunks = chunk_vec(wal_events, chunk_count);

    (0..chunk_count)
        .map(|i| EventBatch {
            slot_id: slot_id.to_string(),
            // Only the final chunk actually advances the durable cursor;
            // earlier chunks are mid-transaction persistence, not a commit
            // boundary on their own.
            up_to_seq: if i + 1 == chunk_count { up_to_seq } else { 0 },
            consumer_events: std::mem::take(&mut event_chunks[i]),
            consumer_records: std::mem::take(&mut record_chunks[i]),
            consumer_deletes: std::mem::take(&mut delete_chunks[i]),
            wal_events: std::mem::take(&mut wal_chunks[i]),
        })
        .collect()
}

fn chunk_vec<T>(mut items: Vec<T>, chunk_count: usize) -> Vec<Vec<T>> {
    let chunk_size = items.len().div_ceil(chunk_count.max(1)).max(1);
    let mut chunks = Vec::with_capacity(chunk_count);
    while chunks.len() + 1 < chunk_count {
        let take = chunk_size.min(items.len());
        chunks.push(items.drain(..take).collect());
    }
    chunks.push(items);
    chunks
}

/// Trivial in-process `EventStore` backed by `Mutex`-guarded `Vec`s, used
/// by the binary's dev mode and by integration tests in place of the real
/// external store.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    consumer_events: Vec<ConsumerEvent>,
    consumer_records: HashMap<(Uuid, u32, String), ConsumerRecord>,
    wal_events: Vec<WalEvent>,
    last_processed_seq: HashMap<String, u64>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer_event_count(&self) -> usize {
        self.inner.lock().unwrap().consumer_events.len()
    }

    pub fn wal_event_count(&self) -> usize {
        self.inner.lock().unwrap().wal_events.len()
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().unwrap().consumer_records.len()
    }

    pub fn last_processed_seq(&self, slot_id: &str) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .last_processed_seq
            .get(slot_id)
            .copied()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn transact(&self, batch: EventBatch) -> ReplicationResult<usize> {
        let mut state = self.inner.lock().unwrap();
        let mut count = 0;

        count += batch.consumer_events.len();
        state.consumer_events.extend(batch.consumer_events);

        for record in batch.consumer_records {
            if let ConsumerRecord::Upsert {
                consumer_id,
                table_oid,
                ref group_id,
                ..
            } = record
            {
                state
                    .consumer_records
                    .insert((consumer_id, table_oid, group_id.clone()), record);
                count += 1;
            }
        }

        for record in batch.consumer_deletes {
            if let ConsumerRecord::Delete {
                consumer_id,
                table_oid,
                ref group_id,
                ..
            } = record
            {
                state
                    .consumer_records
                    .remove(&(consumer_id, table_oid, group_id.clone()));
                count += 1;
            }
        }

        count += batch.wal_events.len();
        state.wal_events.extend(batch.wal_events);

        if batch.up_to_seq > 0 {
            state
                .last_processed_seq
                .insert(batch.slot_id.clone(), batch.up_to_seq);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_tracks_last_processed_seq() {
        let store = InMemoryEventStore::new();
        let persistor = Persistor::new(store);
        let batch = RoutedBatch::default();
        persistor.persist("slot-a", 5, batch).await.unwrap();
        assert_eq!(persistor.store().last_processed_seq("slot-a"), Some(5));
    }

    #[tokio::test]
    async fn persist_notifies_touched_pipelines_and_marks_subscriptions_healthy() {
        let status = Arc::new(StatusRegistry::new());
        let notifier = PipelineNotifier::new();
        let mut rx = notifier.subscribe();
        let persistor =
            Persistor::with_notifications(InMemoryEventStore::new(), status.clone(), notifier);

        let pipeline_id = Uuid::new_v4();
        let consumer_id = Uuid::new_v4();
        let mut batch = RoutedBatch::default();
        batch.wal_events.push(WalEvent {
            pipeline_id,
            commit_lsn: crate::lsn::Lsn::from(1),
            seq: 1,
            action: "insert",
            relation_oid: 1,
        });
        batch.consumer_events.push(ConsumerEvent {
            consumer_id,
            commit_lsn: crate::lsn::Lsn::from(1),
            seq: 1,
            action: "insert",
            relation_oid: 1,
            fields: HashMap::new(),
        });

        persistor.persist("slot-a", 1, batch).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), pipeline_id);
        assert_eq!(
            status.subscription_health(pipeline_id),
            Some(crate::status::SlotHealth::Healthy)
        );
        assert_eq!(
            status.subscription_health(consumer_id),
            Some(crate::status::SlotHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn upsert_then_delete_removes_the_record() {
        let store = InMemoryEventStore::new();
        let consumer_id = Uuid::new_v4();
        let upsert = EventBatch {
            slot_id: "slot-a".to_string(),
            up_to_seq: 1,
            consumer_events: vec![],
            consumer_records: vec![ConsumerRecord::Upsert {
                consumer_id,
                table_oid: 1,
                group_id: "1".to_string(),
                fields: HashMap::new(),
            }],
            consumer_deletes: vec![],
            wal_events: vec![],
        };
        store.transact(upsert).await.unwrap();
        assert_eq!(store.record_count(), 1);

        let delete = EventBatch {
            slot_id: "slot-a".to_string(),
            up_to_seq: 2,
            consumer_events: vec![],
            consumer_records: vec![],
            consumer_deletes: vec![ConsumerRecord::Delete {
                consumer_id,
                table_oid: 1,
                record_pks: vec![crate::casts::CastValue::Int(1)],
                group_id: "1".to_string(),
            }],
            wal_events: vec![],
        };
        store.transact(delete).await.unwrap();
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn chunk_batch_splits_oversized_kind() {
        let mut batch = RoutedBatch::default();
        for i in 0..2_500u64 {
            batch.wal_events.push(WalEvent {
                pipeline_id: Uuid::new_v4(),
                commit_lsn: crate::lsn::Lsn::from(i),
                seq: i,
                action: "insert",
                relation_oid: 1,
            });
        }
        let chunks = chunk_batch(batch, 2_499, "slot-a");
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.wal_events.len()).sum::<usize>(),
            2_500
        );
    }
}
