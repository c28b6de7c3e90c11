//! In-memory event store implementation

use async_trait::async_trait;
use bytes::Bytes;
use plume_storage::{ReadDirection, StorageNamespace, StorageResult, WriteBatch};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;
use tokio_stream::Stream;

/// In-memory event store using BTreeMap for ordering
///
/// Batch commits take both the log and metadata write locks for the whole
/// commit, so a batch is never observable half-applied.
#[derive(Clone)]
pub struct MemoryStore {
    /// Event rows: namespace -> (seq -> bytes)
    logs: Arc<RwLock<HashMap<StorageNamespace, BTreeMap<u64, Bytes>>>>,
    /// Metadata rows: namespace -> bytes
    metas: Arc<RwLock<HashMap<StorageNamespace, Bytes>>>,
    /// Log bounds cache: namespace -> (first_seq, last_seq)
    log_bounds: Arc<RwLock<HashMap<StorageNamespace, (u64, u64)>>>,
}

impl MemoryStore {
    /// Create a new in-memory store instance
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            metas: Arc::new(RwLock::new(HashMap::new())),
            log_bounds: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl plume_storage::EventStore for MemoryStore {
    async fn commit(&self, mut batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut logs = self.logs.write().await;
        let mut metas = self.metas.write().await;
        let mut bounds = self.log_bounds.write().await;

        for (namespace, seq, data) in batch.take_events() {
            let btree = logs.entry(namespace.clone()).or_insert_with(BTreeMap::new);

            let (mut first_seq, mut last_seq) =
                bounds.get(&namespace).copied().unwrap_or((u64::MAX, 0));

            btree.insert(seq, data);

            if first_seq == u64::MAX || seq < first_seq {
                first_seq = seq;
            }
            if seq > last_seq {
                last_seq = seq;
            }
            bounds.insert(namespace, (first_seq, last_seq));
        }

        for (namespace, data) in batch.take_meta() {
            metas.insert(namespace, data);
        }

        Ok(())
    }

    async fn load_meta(&self, namespace: &StorageNamespace) -> StorageResult<Option<Bytes>> {
        let metas = self.metas.read().await;
        Ok(metas.get(namespace).cloned())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        // First check cache
        {
            let bounds = self.log_bounds.read().await;
            if let Some(&cached) = bounds.get(namespace) {
                return Ok(Some(cached));
            }
        }

        // If not in cache, compute from data
        let logs = self.logs.read().await;
        if let Some(btree) = logs.get(namespace) {
            match (btree.keys().next(), btree.keys().next_back()) {
                (Some(&first), Some(&last)) => {
                    drop(logs);
                    let mut bounds = self.log_bounds.write().await;
                    bounds.insert(namespace.clone(), (first, last));
                    Ok(Some((first, last)))
                }
                _ => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let logs = self.logs.read().await;

        if let Some(btree) = logs.get(namespace) {
            let entries: Vec<_> = btree
                .range(start..end)
                .map(|(&seq, data)| (seq, data.clone()))
                .collect();
            Ok(entries)
        } else {
            Ok(Vec::new())
        }
    }

    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
        direction: ReadDirection,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>> {
        let logs = self.logs.read().await;

        let mut entries: Vec<StorageResult<(u64, Bytes)>> = match logs.get(namespace) {
            Some(btree) => {
                let end = end.unwrap_or_else(|| {
                    btree.keys().next_back().map(|&last| last + 1).unwrap_or(start)
                });
                btree
                    .range(start..end)
                    .map(|(&seq, data)| Ok((seq, data.clone())))
                    .collect()
            }
            None => Vec::new(),
        };

        if direction == ReadDirection::Descending {
            entries.reverse();
        }

        Ok(Box::new(tokio_stream::iter(entries)))
    }

    async fn compact_before(&self, namespace: &StorageNamespace, seq: u64) -> StorageResult<()> {
        let mut logs = self.logs.write().await;
        let mut bounds = self.log_bounds.write().await;

        if let Some(btree) = logs.get_mut(namespace) {
            let to_remove: Vec<_> = btree.range(..=seq).map(|(&s, _)| s).collect();
            for s in to_remove {
                btree.remove(&s);
            }

            if btree.is_empty() {
                bounds.remove(namespace);
            } else if let Some((first, _last)) = bounds.get_mut(namespace)
                && let Some(&new_first) = btree.keys().next()
            {
                *first = new_first;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("logs", &"<locked>")
            .field("metas", &"<locked>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use plume_storage::EventStore;
    use tokio_stream::StreamExt;

    fn batch_with(ns: &StorageNamespace, rows: &[(u64, &'static [u8])]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (seq, data) in rows {
            batch.append_event(ns, *seq, Bytes::from_static(data));
        }
        batch
    }

    #[tokio::test]
    async fn test_commit_and_read() {
        let store = MemoryStore::new();
        let ns = StorageNamespace::new("test");

        store
            .commit(batch_with(&ns, &[(1, b"event 1")]))
            .await
            .unwrap();

        let result = store.read_range(&ns, 1, 2).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], (1, Bytes::from("event 1")));

        let bounds = store.bounds(&ns).await.unwrap();
        assert_eq!(bounds, Some((1, 1)));
    }

    #[tokio::test]
    async fn test_commit_is_atomic_across_namespaces() {
        let store = MemoryStore::new();
        let events = StorageNamespace::new("topic/events");
        let meta = StorageNamespace::new("topic/meta");

        let mut batch = WriteBatch::new();
        batch.append_event(&events, 1, Bytes::from_static(b"a"));
        batch.append_event(&events, 2, Bytes::from_static(b"b"));
        batch.put_meta(&meta, Bytes::from_static(b"applied=2"));
        store.commit(batch).await.unwrap();

        let rows = store.read_range(&events, 1, 3).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            store.load_meta(&meta).await.unwrap(),
            Some(Bytes::from("applied=2"))
        );
    }

    #[tokio::test]
    async fn test_meta_row_is_replaced() {
        let store = MemoryStore::new();
        let meta = StorageNamespace::new("topic/meta");

        let mut batch = WriteBatch::new();
        batch.put_meta(&meta, Bytes::from_static(b"v1"));
        store.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put_meta(&meta, Bytes::from_static(b"v2"));
        store.commit(batch).await.unwrap();

        assert_eq!(store.load_meta(&meta).await.unwrap(), Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_stream_range_ascending_and_descending() {
        let store = MemoryStore::new();
        let ns = StorageNamespace::new("test");

        store
            .commit(batch_with(&ns, &[(1, b"a"), (2, b"b"), (3, b"c")]))
            .await
            .unwrap();

        let mut stream = store
            .stream_range(&ns, 1, None, ReadDirection::Ascending)
            .await
            .unwrap();
        let mut seqs = Vec::new();
        while let Some(row) = stream.next().await {
            seqs.push(row.unwrap().0);
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        let mut stream = store
            .stream_range(&ns, 1, Some(3), ReadDirection::Descending)
            .await
            .unwrap();
        let mut seqs = Vec::new();
        while let Some(row) = stream.next().await {
            seqs.push(row.unwrap().0);
        }
        assert_eq!(seqs, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_compact() {
        let store = MemoryStore::new();
        let ns = StorageNamespace::new("test");

        store
            .commit(batch_with(
                &ns,
                &[(1, b"a"), (2, b"b"), (3, b"c"), (4, b"d"), (5, b"e")],
            ))
            .await
            .unwrap();

        store.compact_before(&ns, 3).await.unwrap();

        let range = store.read_range(&ns, 1, 6).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, 4);
        assert_eq!(range[1].0, 5);

        let bounds = store.bounds(&ns).await.unwrap();
        assert_eq!(bounds, Some((4, 5)));
    }
}
