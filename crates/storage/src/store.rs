//! Event store trait and batch types

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Display;
use tokio_stream::Stream;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Invalid value format
    #[error("Invalid value format: {0}")]
    InvalidValue(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace not found
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

/// A namespace for organizing data
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction for ordered range reads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadDirection {
    /// Lowest sequence first
    #[default]
    Ascending,
    /// Highest sequence first
    Descending,
}

/// A buffered write batch scoped to one apply cycle
///
/// Rows are buffered in memory until the batch is handed to
/// [`EventStore::commit`]. A batch may touch several namespaces; the commit
/// is atomic across all of them.
#[derive(Debug, Default)]
pub struct WriteBatch {
    events: Vec<(StorageNamespace, u64, Bytes)>,
    meta: Vec<(StorageNamespace, Bytes)>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event row at the given sequence
    pub fn append_event(&mut self, namespace: &StorageNamespace, seq: u64, data: Bytes) {
        self.events.push((namespace.clone(), seq, data));
    }

    /// Buffer the metadata row for a namespace (replaces any previous value)
    pub fn put_meta(&mut self, namespace: &StorageNamespace, data: Bytes) {
        self.meta.push((namespace.clone(), data));
    }

    /// Whether the batch holds no writes
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.meta.is_empty()
    }

    /// Number of buffered writes
    pub fn len(&self) -> usize {
        self.events.len() + self.meta.len()
    }

    /// Drain the buffered event rows
    pub fn take_events(&mut self) -> Vec<(StorageNamespace, u64, Bytes)> {
        std::mem::take(&mut self.events)
    }

    /// Drain the buffered metadata rows
    pub fn take_meta(&mut self) -> Vec<(StorageNamespace, Bytes)> {
        std::mem::take(&mut self.meta)
    }
}

/// Durable event-log store: indexed byte rows plus one metadata row per
/// namespace, committed in atomic batches
#[async_trait]
pub trait EventStore: Clone + Send + Sync + 'static {
    /// Atomically flush a write batch; must either fully succeed or fully
    /// fail
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Point read of the metadata row for a namespace
    async fn load_meta(&self, namespace: &StorageNamespace) -> StorageResult<Option<Bytes>>;

    /// Get the current bounds of the event log (first_seq, last_seq)
    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>>;

    /// Read a range of event rows [start, end)
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>>;

    /// Stream event rows from a range [start, end)
    ///
    /// Returns a lazy stream of (seq, data) pairs, ordered by `direction`.
    /// If `end` is None, the range extends to the last available row at the
    /// time of the call; the stream is finite and restartable per call.
    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
        direction: ReadDirection,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>>;

    /// Remove all event rows up to and including the given sequence
    async fn compact_before(&self, namespace: &StorageNamespace, seq: u64) -> StorageResult<()>;
}

/// Implement EventStore for Arc<T> where T: EventStore
#[async_trait]
impl<T: EventStore> EventStore for std::sync::Arc<T> {
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        (**self).commit(batch).await
    }

    async fn load_meta(&self, namespace: &StorageNamespace) -> StorageResult<Option<Bytes>> {
        (**self).load_meta(namespace).await
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        (**self).bounds(namespace).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        (**self).read_range(namespace, start, end).await
    }

    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
        direction: ReadDirection,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>> {
        (**self).stream_range(namespace, start, end, direction).await
    }

    async fn compact_before(&self, namespace: &StorageNamespace, seq: u64) -> StorageResult<()> {
        (**self).compact_before(namespace, seq).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_buffers_in_order() {
        let ns = StorageNamespace::new("topic/events");
        let meta_ns = StorageNamespace::new("topic/meta");

        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.append_event(&ns, 1, Bytes::from_static(b"a"));
        batch.append_event(&ns, 2, Bytes::from_static(b"b"));
        batch.put_meta(&meta_ns, Bytes::from_static(b"m"));

        assert_eq!(batch.len(), 3);

        let events = batch.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, 1);
        assert_eq!(events[1].1, 2);

        let meta = batch.take_meta();
        assert_eq!(meta.len(), 1);
        assert!(batch.is_empty());
    }
}
