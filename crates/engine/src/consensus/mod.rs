//! Consensus substrate seam
//!
//! The engine never talks to a consensus library directly; it proposes
//! commands and issues linearizable local reads through this trait. A real
//! deployment backs it with a replicated log, tests and single-replica
//! embeddings use [`LocalSubstrate`].

use async_trait::async_trait;

use crate::command::{Command, CommandResult};
use crate::error::EngineResult;
use crate::state_machine::{LookupRequest, LookupResponse};

mod local;

pub use local::LocalSubstrate;

/// The replication seam between the service and a consensus implementation
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Propose a command and wait for this replica to apply it
    ///
    /// Resolves with the proposing replica's per-entry result once the
    /// command is committed and applied locally.
    async fn propose(&self, command: Command) -> EngineResult<CommandResult>;

    /// Answer a query against this replica's applied state
    async fn sync_read(&self, query: LookupRequest) -> EngineResult<LookupResponse>;
}
