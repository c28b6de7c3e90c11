//! Deterministic in-process substrate
//!
//! Replaces the replicated log with a mutex-serialized counter: every
//! proposal is assigned the next index and applied, in order, to every
//! attached state machine before the next proposal is admitted. This gives
//! tests the same ordering and activation-locality semantics a real
//! substrate provides, minus the network.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use plume_storage::EventStore;

use crate::command::{Command, CommandResult, Entry};
use crate::consensus::Substrate;
use crate::error::{EngineResult, Error};
use crate::state_machine::{LookupRequest, LookupResponse, TopicStateMachine};

/// In-process substrate over one or more co-located state machines
pub struct LocalSubstrate<S: EventStore> {
    machines: Vec<Arc<TopicStateMachine<S>>>,
    /// Index of the machine that answers reads and reports propose results
    local: usize,
    /// Last assigned log index; the lock also serializes applies
    log: Mutex<u64>,
}

impl<S: EventStore> LocalSubstrate<S> {
    /// Single-replica substrate
    pub fn new(machine: Arc<TopicStateMachine<S>>) -> Self {
        Self {
            machines: vec![machine],
            local: 0,
            log: Mutex::new(0),
        }
    }

    /// Substrate spanning several co-located replicas
    ///
    /// `local` selects which machine plays the role of this process's
    /// replica for reads and propose results.
    pub fn with_replicas(
        machines: Vec<Arc<TopicStateMachine<S>>>,
        local: usize,
    ) -> EngineResult<Self> {
        if machines.is_empty() {
            return Err(Error::validation("substrate needs at least one replica"));
        }
        if local >= machines.len() {
            return Err(Error::validation(format!(
                "local replica index {local} out of range for {} machines",
                machines.len()
            )));
        }
        Ok(Self {
            machines,
            local,
            log: Mutex::new(0),
        })
    }
}

#[async_trait]
impl<S: EventStore> Substrate for LocalSubstrate<S> {
    async fn propose(&self, command: Command) -> EngineResult<CommandResult> {
        let mut log = self.log.lock().await;
        *log += 1;
        let entry = Entry::from_command(*log, &command)?;
        debug!(index = *log, command = command.kind.name(), "proposal committed");

        let mut local_result = None;
        for (i, machine) in self.machines.iter().enumerate() {
            let mut results = machine.update(vec![entry.clone()]).await?;
            if i == self.local {
                local_result = results.pop();
            }
        }

        local_result.ok_or_else(|| Error::internal("apply produced no result for the entry"))
    }

    async fn sync_read(&self, query: LookupRequest) -> EngineResult<LookupResponse> {
        self.machines[self.local].lookup(query).await
    }
}
