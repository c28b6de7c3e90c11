//! Application hook contract
//!
//! The hook is how an embedding application participates in the apply
//! pipeline without owning it. The state machine calls `prepare_update` once
//! per batch, `on_update` once per entry, and `apply` once per batch to
//! commit everything durably. Work an entry wants to do only after the batch
//! is durable (broadcasts, notifications) is returned from `on_update` as a
//! [`Deferred`] closure and run by the state machine after `apply` succeeds.

use async_trait::async_trait;
use futures::future::BoxFuture;

use plume_storage::{EventStore, WriteBatch};

use crate::command::{Command, Entry};
use crate::error::EngineResult;
use crate::state_machine::{LookupRequest, LookupResponse};

/// A post-commit action produced while processing one entry
///
/// Deferred closures run in entry order, strictly after the batch commit.
/// If the commit fails none of them run.
pub type Deferred = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Hook points an embedding application implements
///
/// Only `apply` is required; the default implementations of the other
/// operations do nothing. Implementations must not write to the store
/// outside the batch handed to them, or the single-commit-per-update
/// boundary is lost.
#[async_trait]
pub trait ApplicationHook: Send + Sync {
    /// Called once when the state machine opens, before any update
    async fn init(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Called once per update batch before any entry is processed
    async fn prepare_update(&self, batch: &mut WriteBatch) -> EngineResult<()> {
        let _ = batch;
        Ok(())
    }

    /// Called once per entry, before the engine dispatches the command
    ///
    /// May buffer additional rows into the batch and may return a deferred
    /// closure to run after the commit. An error vetoes the entry: it is
    /// recorded as that entry's result, the engine stages no effects for it,
    /// and the rest of the batch proceeds.
    async fn on_update(
        &self,
        batch: &mut WriteBatch,
        entry: &Entry,
        command: &Command,
    ) -> EngineResult<Option<Deferred>> {
        let _ = (batch, entry, command);
        Ok(None)
    }

    /// Commit the batch durably; called exactly once per update batch
    ///
    /// Failure here is fatal to the replica: the applied index was staged in
    /// the batch and must not advance without it.
    async fn apply(&self, batch: WriteBatch) -> EngineResult<()>;

    /// Intercept a local query; `None` falls through to the engine
    async fn lookup(&self, query: &LookupRequest) -> EngineResult<Option<LookupResponse>> {
        let _ = query;
        Ok(None)
    }
}

/// The stock hook: commits each batch through the injected store
#[derive(Debug, Clone)]
pub struct DurableHook<S: EventStore> {
    store: S,
}

impl<S: EventStore> DurableHook<S> {
    /// Create a hook that commits through `store`
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: EventStore> ApplicationHook for DurableHook<S> {
    async fn apply(&self, batch: WriteBatch) -> EngineResult<()> {
        self.store.commit(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_storage::StorageNamespace;
    use plume_storage_memory::MemoryStore;

    #[tokio::test]
    async fn durable_hook_commits_through_store() {
        let store = MemoryStore::new();
        let hook = DurableHook::new(store.clone());
        let ns = StorageNamespace::new("t/meta");

        let mut batch = WriteBatch::new();
        batch.put_meta(&ns, bytes::Bytes::from_static(b"state"));
        hook.apply(batch).await.unwrap();

        assert_eq!(
            store.load_meta(&ns).await.unwrap(),
            Some(bytes::Bytes::from_static(b"state"))
        );
    }
}
