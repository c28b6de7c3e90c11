//! Durable event-log storage abstraction
//!
//! This crate defines the storage contract the replicated topic engine
//! persists through: indexed event rows plus a small metadata row per
//! namespace, written atomically in batches. The engine prepares one
//! [`WriteBatch`] per applied batch of committed commands; the batch either
//! commits fully or not at all, which is what lets event broadcast be
//! deferred until durability is confirmed.
//!
//! Key features:
//! - Atomic multi-namespace batch commit (event rows + metadata together)
//! - Point read of the metadata row by namespace
//! - Ordered range reads of event rows, ascending or descending
//! - Native streaming support for arbitrarily long logs

mod store;

pub use store::{
    EventStore, ReadDirection, StorageError, StorageNamespace, StorageResult, WriteBatch,
};
