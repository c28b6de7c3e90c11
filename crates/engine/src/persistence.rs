//! Durable metadata and event-log binding
//!
//! Ties the state machine to an [`EventStore`]: the applied index and
//! counters live in a small metadata row, event rows are keyed by event id,
//! and both are buffered into the same [`WriteBatch`] so they commit at the
//! same boundary as the apply step.

use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use plume_storage::{EventStore, ReadDirection, StorageNamespace, WriteBatch};

use crate::command::Event;
use crate::error::{EngineResult, Error};
use crate::types::ShardId;

/// Namespace holding the event rows of a shard
pub fn events_namespace(shard: ShardId) -> StorageNamespace {
    StorageNamespace::new(format!("{shard}/events"))
}

/// Namespace holding the metadata row of a shard
pub fn meta_namespace(shard: ShardId) -> StorageNamespace {
    StorageNamespace::new(format!("{shard}/meta"))
}

/// Replication metadata persisted once per applied batch
///
/// The applied index is strictly monotonic; an apply at or below the
/// recorded value indicates replay or out-of-order commit delivery and is
/// treated as a non-recoverable defect by the state machine. This struct is
/// also the entire snapshot payload: bulk event data stays in the durable
/// store, which a joining replica reaches independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Last applied consensus log index
    pub applied_index: u64,
    /// Event-sequence counter, advanced inside the commit boundary
    pub event_seq: u64,
    /// Last announced shard leader, if any
    pub leader: Option<u64>,
}

impl AppliedState {
    /// Encode to the compact metadata-row form
    pub fn encode(&self) -> EngineResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| Error::internal(format!("failed to encode applied state: {e}")))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from the metadata-row form
    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        ciborium::de::from_reader(data)
            .map_err(|e| Error::storage(format!("corrupt applied state row: {e}")))
    }
}

/// Load the persisted applied state for a shard, if any
pub async fn load_applied<S: EventStore>(
    store: &S,
    meta_ns: &StorageNamespace,
) -> EngineResult<Option<AppliedState>> {
    match store.load_meta(meta_ns).await? {
        Some(data) => Ok(Some(AppliedState::decode(&data)?)),
        None => Ok(None),
    }
}

/// Buffer an event row into the batch, keyed by the event's id
pub fn append_event_row(
    batch: &mut WriteBatch,
    events_ns: &StorageNamespace,
    event: &Event,
) -> EngineResult<()> {
    batch.append_event(events_ns, event.id, event.encode()?);
    Ok(())
}

/// Filter for historical event reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// First event id to include (defaults to the start of the log)
    pub start: Option<u64>,
    /// Exclusive upper bound on event ids (defaults to the end of the log)
    pub end: Option<u64>,
    /// Yield highest ids first
    pub descending: bool,
    /// Skip events older than this server timestamp
    pub since_ms: Option<u64>,
}

/// Lazily read historical events in id order
///
/// The stream is finite per call and decodes rows on demand, so arbitrarily
/// long logs are never materialized in memory.
pub async fn read_events<S: EventStore>(
    store: &S,
    events_ns: &StorageNamespace,
    filter: EventFilter,
) -> EngineResult<BoxStream<'static, EngineResult<Event>>> {
    let direction = if filter.descending {
        ReadDirection::Descending
    } else {
        ReadDirection::Ascending
    };

    let mut rows = store
        .stream_range(events_ns, filter.start.unwrap_or(0), filter.end, direction)
        .await?;

    let stream = try_stream! {
        while let Some(row) = rows.next().await {
            let (_, data) = row?;
            let event = Event::decode(&data)?;
            if let Some(since) = filter.since_ms
                && event.timestamp_ms < since
            {
                continue;
            }
            yield event;
        }
    };

    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WIRE_VERSION;
    use plume_storage_memory::MemoryStore;

    fn event(id: u64, ts: u64) -> Event {
        Event {
            id,
            name: "publish-message".to_string(),
            version: WIRE_VERSION,
            data: serde_json::json!({ "n": id }),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn applied_state_round_trips() {
        let state = AppliedState {
            applied_index: 42,
            event_seq: 7,
            leader: Some(3),
        };
        let decoded = AppliedState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn applied_state_rejects_garbage() {
        assert!(AppliedState::decode(b"not cbor at all").is_err());
    }

    #[tokio::test]
    async fn read_events_filters_and_orders() {
        let store = MemoryStore::new();
        let ns = events_namespace(ShardId::new(1));

        let mut batch = WriteBatch::new();
        for (id, ts) in [(1, 100), (2, 200), (3, 300)] {
            append_event_row(&mut batch, &ns, &event(id, ts)).unwrap();
        }
        store.commit(batch).await.unwrap();

        let mut stream = read_events(&store, &ns, EventFilter::default())
            .await
            .unwrap();
        let mut ids = Vec::new();
        while let Some(ev) = stream.next().await {
            ids.push(ev.unwrap().id);
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let mut stream = read_events(
            &store,
            &ns,
            EventFilter {
                descending: true,
                since_ms: Some(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut ids = Vec::new();
        while let Some(ev) = stream.next().await {
            ids.push(ev.unwrap().id);
        }
        assert_eq!(ids, vec![3, 2]);
    }
}
