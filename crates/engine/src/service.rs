//! Client-facing topic service
//!
//! The service is the only surface an embedding application needs: it pairs
//! a consensus substrate with this replica's identity and turns the
//! subscribe/publish/query verbs into proposals and local reads. Proposals
//! are bounded by the configured timeout so a stalled substrate surfaces as
//! an error instead of a hang.

use std::sync::Arc;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use plume_storage_memory::MemoryStore;

use crate::command::{Command, CommandResult, Event};
use crate::config::EngineConfig;
use crate::consensus::{LocalSubstrate, Substrate};
use crate::error::{EngineResult, Error};
use crate::persistence::EventFilter;
use crate::state_machine::{LookupRequest, LookupResponse, TopicMetadata, TopicStateMachine};
use crate::subscription::Subscription;
use crate::topic::Topic;
use crate::types::{ReplicaId, ShardId, SubscriptionId};

/// A registered, activated subscription handed back to the caller
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    /// The subscription's registry key
    pub id: SubscriptionId,
    /// Handle to this replica's channel
    pub subscription: Arc<Subscription>,
}

/// Replicated pub/sub over one topic shard
#[derive(Clone)]
pub struct TopicService {
    substrate: Arc<dyn Substrate>,
    replica_id: ReplicaId,
    propose_timeout: std::time::Duration,
}

impl TopicService {
    /// Create a service over an existing substrate
    pub fn new(substrate: Arc<dyn Substrate>, config: &EngineConfig) -> Self {
        Self {
            substrate,
            replica_id: ReplicaId::new(config.replica_id),
            propose_timeout: config.propose_timeout,
        }
    }

    /// Build a self-contained single-replica engine over the memory store
    ///
    /// Opens the state machine before returning; the machine is handed back
    /// alongside the service for callers that drive snapshots or shutdown.
    pub async fn in_memory(
        config: EngineConfig,
    ) -> EngineResult<(Self, Arc<TopicStateMachine<MemoryStore>>)> {
        let replica_id = ReplicaId::new(config.replica_id);
        let topic = Topic::new(replica_id, config.topic.clone());
        let machine = Arc::new(TopicStateMachine::new(
            ShardId::new(config.shard_id),
            replica_id,
            topic,
            MemoryStore::new(),
        ));
        machine.open().await?;

        let substrate = Arc::new(LocalSubstrate::new(machine.clone()));
        Ok((Self::new(substrate, &config), machine))
    }

    async fn propose(&self, command: Command) -> EngineResult<CommandResult> {
        let name = command.kind.name();
        tokio::time::timeout(self.propose_timeout, self.substrate.propose(command))
            .await
            .map_err(|_| Error::timeout(format!("proposal {name} timed out")))?
    }

    /// Register and activate a subscription on this replica
    ///
    /// Registration is a local read; activation goes through the log so
    /// every replica agrees on when this subscriber became eligible for
    /// events. The handle is live once this returns.
    pub async fn subscribe(&self) -> EngineResult<SubscriptionHandle> {
        let LookupResponse::Subscribed { id, subscription } =
            self.substrate.sync_read(LookupRequest::Subscribe).await?
        else {
            return Err(Error::internal("subscribe returned a non-subscription"));
        };

        let command = Command::start_subscription(id, self.replica_id.value());
        match self.propose(command).await? {
            CommandResult::Applied { .. } => {
                debug!(subscription = %id, "subscription activated");
                Ok(SubscriptionHandle { id, subscription })
            }
            CommandResult::Ignored { reason } => Err(Error::consensus(format!(
                "activation ignored on own replica: {reason}"
            ))),
            CommandResult::Error { message } => Err(Error::operation_failed(message)),
        }
    }

    /// Publish a message to every replica's local subscribers
    ///
    /// Resolves with the id of the durable event once this replica has
    /// committed and broadcast it.
    pub async fn publish(&self, payload: serde_json::Value) -> EngineResult<u64> {
        match self.propose(Command::publish(payload)).await? {
            CommandResult::Applied {
                event_id: Some(id),
            } => Ok(id),
            CommandResult::Applied { event_id: None } => {
                Err(Error::internal("publish applied without an event"))
            }
            CommandResult::Ignored { reason } => Err(Error::operation_failed(reason)),
            CommandResult::Error { message } => Err(Error::operation_failed(message)),
        }
    }

    /// Subscribe and start listening in one call
    ///
    /// Cancelling the token closes the subscription; if an exit sentinel is
    /// configured it arrives on the receiver first.
    pub async fn tail(
        &self,
        cancel: CancellationToken,
    ) -> EngineResult<(SubscriptionId, flume::Receiver<Event>)> {
        let handle = self.subscribe().await?;
        let rx = handle.subscription.listen(cancel)?;
        Ok((handle.id, rx))
    }

    /// This replica's view of the topic
    pub async fn metadata(&self) -> EngineResult<TopicMetadata> {
        match self.substrate.sync_read(LookupRequest::Metadata).await? {
            LookupResponse::Metadata(meta) => Ok(meta),
            _ => Err(Error::internal("metadata query returned a non-metadata")),
        }
    }

    /// Stream historical events from the durable log
    pub async fn events(
        &self,
        filter: EventFilter,
    ) -> EngineResult<BoxStream<'static, EngineResult<Event>>> {
        match self
            .substrate
            .sync_read(LookupRequest::Events(filter))
            .await?
        {
            LookupResponse::Events(stream) => Ok(stream),
            _ => Err(Error::internal("event query returned a non-stream")),
        }
    }
}
