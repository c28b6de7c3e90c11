//! Consensus state machine adapter
//!
//! Adapts the topic to the lifecycle a consensus substrate drives: open,
//! apply committed entry batches, answer local queries, snapshot, recover,
//! close. Each update batch stages its event rows and the applied-state
//! metadata row into one [`WriteBatch`], commits it exactly once through the
//! application hook, and only then runs the deferred broadcasts produced by
//! the batch's entries. The substrate guarantees updates are delivered
//! serially per replica; nothing here defends against concurrent `update`
//! calls.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use plume_storage::{EventStore, StorageNamespace, WriteBatch};

use crate::command::{Command, CommandKind, CommandResult, Entry, Event};
use crate::error::{EngineResult, Error};
use crate::hook::{ApplicationHook, Deferred, DurableHook};
use crate::persistence::{self, AppliedState, EventFilter};
use crate::subscription::Subscription;
use crate::topic::Topic;
use crate::types::{ReplicaId, ShardId, SubscriptionId, now_ms};

/// Local query against one replica's state machine
#[derive(Debug, Clone)]
pub enum LookupRequest {
    /// Register a new subscription on this replica
    Subscribe,
    /// Fetch an existing subscription by its wire-form key
    Subscription(String),
    /// Report topic metadata
    Metadata,
    /// Stream historical events from the durable log
    Events(EventFilter),
}

/// Answer to a [`LookupRequest`]
///
/// Subscription handles are in-process objects tied to this replica's
/// channels; they are deliberately not serializable.
pub enum LookupResponse {
    /// A subscription on this replica
    Subscribed {
        /// The subscription's registry key
        id: SubscriptionId,
        /// Handle to the local channel
        subscription: Arc<Subscription>,
    },
    /// Topic metadata
    Metadata(TopicMetadata),
    /// Historical events, lazily decoded
    Events(BoxStream<'static, EngineResult<Event>>),
}

impl std::fmt::Debug for LookupResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribed { id, .. } => f.debug_struct("Subscribed").field("id", id).finish(),
            Self::Metadata(meta) => f.debug_tuple("Metadata").field(meta).finish(),
            Self::Events(_) => f.debug_tuple("Events").finish(),
        }
    }
}

/// Snapshot of one replica's view of the topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    /// Consensus shard the topic belongs to
    pub shard_id: u64,
    /// This replica's id
    pub replica_id: u64,
    /// Last applied consensus log index
    pub applied_index: u64,
    /// Last issued event id
    pub event_seq: u64,
    /// Last announced shard leader
    pub leader: Option<u64>,
    /// Subscriptions currently registered on this replica
    pub subscriptions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineState {
    Unopened,
    Open,
    Closed,
}

/// The replicated state machine for one topic shard
pub struct TopicStateMachine<S: EventStore> {
    shard_id: ShardId,
    replica_id: ReplicaId,
    topic: Arc<Topic>,
    store: S,
    hook: Arc<dyn ApplicationHook>,
    events_ns: StorageNamespace,
    meta_ns: StorageNamespace,
    state: RwLock<MachineState>,
    applied: RwLock<AppliedState>,
}

impl<S: EventStore> TopicStateMachine<S> {
    /// Create a state machine with the stock durable hook
    pub fn new(shard_id: ShardId, replica_id: ReplicaId, topic: Arc<Topic>, store: S) -> Self {
        let hook = Arc::new(DurableHook::new(store.clone()));
        Self::with_hook(shard_id, replica_id, topic, store, hook)
    }

    /// Create a state machine with an application-supplied hook
    pub fn with_hook(
        shard_id: ShardId,
        replica_id: ReplicaId,
        topic: Arc<Topic>,
        store: S,
        hook: Arc<dyn ApplicationHook>,
    ) -> Self {
        Self {
            events_ns: persistence::events_namespace(shard_id),
            meta_ns: persistence::meta_namespace(shard_id),
            shard_id,
            replica_id,
            topic,
            store,
            hook,
            state: RwLock::new(MachineState::Unopened),
            applied: RwLock::new(AppliedState::default()),
        }
    }

    /// This replica's id
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// The shard this machine serves
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// The local topic registry
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Last applied consensus log index
    pub async fn applied_index(&self) -> u64 {
        self.applied.read().await.applied_index
    }

    async fn ensure_open(&self) -> EngineResult<()> {
        match *self.state.read().await {
            MachineState::Open => Ok(()),
            MachineState::Unopened => Err(Error::invalid_state("state machine not opened")),
            MachineState::Closed => Err(Error::invalid_state("state machine closed")),
        }
    }

    /// Load persisted metadata and report the index to resume from
    pub async fn open(&self) -> EngineResult<u64> {
        let mut state = self.state.write().await;
        if *state != MachineState::Unopened {
            return Err(Error::invalid_state("state machine already opened"));
        }

        let recovered = persistence::load_applied(&self.store, &self.meta_ns)
            .await?
            .unwrap_or_default();
        self.hook.init().await?;
        *self.applied.write().await = recovered;
        *state = MachineState::Open;

        info!(
            shard = %self.shard_id,
            replica = %self.replica_id,
            applied_index = recovered.applied_index,
            event_seq = recovered.event_seq,
            "state machine opened"
        );
        Ok(recovered.applied_index)
    }

    /// Answer a local query; never goes through the consensus log
    pub async fn lookup(&self, query: LookupRequest) -> EngineResult<LookupResponse> {
        self.ensure_open().await?;

        if let Some(response) = self.hook.lookup(&query).await? {
            return Ok(response);
        }

        match query {
            LookupRequest::Subscribe => {
                let (id, subscription) = self.topic.subscribe().await;
                Ok(LookupResponse::Subscribed { id, subscription })
            }
            LookupRequest::Subscription(key) => {
                let subscription = self.topic.get_subscription(&key).await?;
                Ok(LookupResponse::Subscribed {
                    id: subscription.id(),
                    subscription,
                })
            }
            LookupRequest::Metadata => {
                let applied = *self.applied.read().await;
                Ok(LookupResponse::Metadata(TopicMetadata {
                    shard_id: self.shard_id.value(),
                    replica_id: self.replica_id.value(),
                    applied_index: applied.applied_index,
                    event_seq: applied.event_seq,
                    leader: applied.leader,
                    subscriptions: self.topic.subscription_count().await,
                }))
            }
            LookupRequest::Events(filter) => {
                let stream = persistence::read_events(&self.store, &self.events_ns, filter).await?;
                Ok(LookupResponse::Events(stream))
            }
        }
    }

    /// Apply a batch of committed entries
    ///
    /// Per-entry failures (malformed payload, unknown subscription) are
    /// reported in the entry's [`CommandResult`] and never abort the batch.
    /// A commit failure is fatal: the machine closes and no deferred work
    /// runs.
    ///
    /// # Panics
    ///
    /// Panics if an entry's index is at or below the applied index. That
    /// means the substrate replayed or reordered committed entries, and
    /// continuing would silently diverge the replicas.
    pub async fn update(&self, entries: Vec<Entry>) -> EngineResult<Vec<CommandResult>> {
        self.ensure_open().await?;

        let mut applied = *self.applied.read().await;
        let mut batch = WriteBatch::new();
        self.hook.prepare_update(&mut batch).await?;

        let mut results = Vec::with_capacity(entries.len());
        let mut deferred: Vec<Deferred> = Vec::new();

        for entry in &entries {
            assert!(
                entry.index > applied.applied_index,
                "applied index regression: entry {} delivered after {} was applied on {}",
                entry.index,
                applied.applied_index,
                self.replica_id,
            );
            applied.applied_index = entry.index;

            let command = match Command::decode(&entry.payload) {
                Ok(command) => command,
                Err(err) => {
                    warn!(index = entry.index, %err, "malformed command entry");
                    results.push(CommandResult::Error {
                        message: format!("malformed command: {err}"),
                    });
                    continue;
                }
            };

            // The hook sees the entry before the engine stages anything: a
            // rejection must leave no row, no counter advance and no
            // deferred broadcast, or the proposer is told the entry failed
            // while its effects happen anyway.
            let hook_action = match self.hook.on_update(&mut batch, entry, &command).await {
                Ok(action) => action,
                Err(err) => {
                    warn!(index = entry.index, %err, "application hook rejected entry");
                    results.push(CommandResult::Error {
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            let result = self
                .apply_command(&command, &mut applied, &mut batch, &mut deferred)
                .await?;
            if let Some(action) = hook_action {
                deferred.push(action);
            }
            results.push(result);
        }

        batch.put_meta(&self.meta_ns, applied.encode()?);

        if let Err(err) = self.hook.apply(batch).await {
            error!(
                shard = %self.shard_id,
                replica = %self.replica_id,
                %err,
                "batch commit failed, closing state machine"
            );
            // Same shutdown as close(): local listeners must observe the
            // stop instead of hanging on a channel nobody feeds.
            self.shutdown().await;
            return Err(err);
        }

        *self.applied.write().await = applied;

        // Deferred work runs only now: the batch is durable, so a crash can
        // no longer produce a broadcast-without-row.
        for action in deferred {
            action().await;
        }

        Ok(results)
    }

    async fn apply_command(
        &self,
        command: &Command,
        applied: &mut AppliedState,
        batch: &mut WriteBatch,
        deferred: &mut Vec<Deferred>,
    ) -> EngineResult<CommandResult> {
        match &command.kind {
            CommandKind::StartSubscription(data) => {
                if data.replica_id != self.replica_id.value() {
                    debug!(
                        subscription = %data.subscription_id,
                        owner = data.replica_id,
                        "subscription owned elsewhere, ignoring activation"
                    );
                    return Ok(CommandResult::Ignored {
                        reason: format!(
                            "subscription {} is owned by replica {}",
                            data.subscription_id, data.replica_id
                        ),
                    });
                }
                // Activation is synchronous with the apply: the lock-step
                // point after which publishes reach this subscriber.
                match self.topic.get(&data.subscription_id).await {
                    Ok(subscription) => {
                        subscription.start();
                        Ok(CommandResult::Applied { event_id: None })
                    }
                    Err(err) => {
                        warn!(
                            subscription = %data.subscription_id,
                            %err,
                            "activation for unknown subscription"
                        );
                        Ok(CommandResult::Error {
                            message: err.to_string(),
                        })
                    }
                }
            }
            CommandKind::PublishMessage { payload } => {
                self.stage_event(command, payload.clone(), applied, batch, deferred)
            }
            CommandKind::NotifyOnline { peer } | CommandKind::NotifyOffline { peer } => {
                let payload = serde_json::json!({ "peer": peer });
                self.stage_event(command, payload, applied, batch, deferred)
            }
            CommandKind::UpdateLeader { replica_id } => {
                debug!(shard = %self.shard_id, leader = replica_id, "leader updated");
                applied.leader = Some(*replica_id);
                Ok(CommandResult::Applied { event_id: None })
            }
        }
    }

    /// Stage an event row into the batch and defer its broadcast
    fn stage_event(
        &self,
        command: &Command,
        payload: serde_json::Value,
        applied: &mut AppliedState,
        batch: &mut WriteBatch,
        deferred: &mut Vec<Deferred>,
    ) -> EngineResult<CommandResult> {
        applied.event_seq += 1;
        let event = Event {
            id: applied.event_seq,
            name: command.kind.name().to_string(),
            version: command.version,
            data: payload,
            timestamp_ms: now_ms(),
        };

        if let Err(err) = persistence::append_event_row(batch, &self.events_ns, &event) {
            // Unencodable payload: charge it to the entry, roll the counter
            // back so the id is reused by the next event.
            applied.event_seq -= 1;
            return Ok(CommandResult::Error {
                message: format!("unencodable event payload: {err}"),
            });
        }

        let event_id = event.id;
        let topic = Arc::clone(&self.topic);
        deferred.push(Box::new(move || {
            Box::pin(async move {
                match topic.broadcast(event).await {
                    Ok(delivered) => {
                        debug!(event = event_id, delivered, "event broadcast");
                    }
                    Err(err) => {
                        error!(event = event_id, %err, "post-commit broadcast failed");
                    }
                }
            })
        }));

        Ok(CommandResult::Applied {
            event_id: Some(event_id),
        })
    }

    /// Capture a consistent view for snapshotting
    ///
    /// The snapshot carries only replication metadata; event rows live in
    /// the durable store that a recovering replica reaches independently, so
    /// this is cheap no matter how long the event log is.
    pub async fn prepare_snapshot(&self) -> EngineResult<AppliedState> {
        self.ensure_open().await?;
        Ok(*self.applied.read().await)
    }

    /// Serialize a prepared snapshot
    pub async fn save_snapshot(&self, prepared: &AppliedState) -> EngineResult<Bytes> {
        prepared.encode()
    }

    /// Install a snapshot received from a peer
    ///
    /// The recovered metadata is persisted immediately so a restart resumes
    /// from it rather than from before the snapshot.
    pub async fn recover_from_snapshot(&self, data: &[u8]) -> EngineResult<()> {
        self.ensure_open().await?;
        let recovered = AppliedState::decode(data)?;

        let mut batch = WriteBatch::new();
        batch.put_meta(&self.meta_ns, recovered.encode()?);
        self.store.commit(batch).await?;

        *self.applied.write().await = recovered;
        info!(
            shard = %self.shard_id,
            replica = %self.replica_id,
            applied_index = recovered.applied_index,
            "recovered from snapshot"
        );
        Ok(())
    }

    /// Stop serving; idempotent
    ///
    /// Local subscriptions are closed so listeners observe the shutdown.
    pub async fn close(&self) -> EngineResult<()> {
        if self.shutdown().await {
            info!(shard = %self.shard_id, replica = %self.replica_id, "state machine closed");
        }
        Ok(())
    }

    /// Mark the machine closed and close every local subscription
    ///
    /// Returns false if the machine was already closed.
    async fn shutdown(&self) -> bool {
        let mut state = self.state.write().await;
        if *state == MachineState::Closed {
            return false;
        }
        *state = MachineState::Closed;
        drop(state);

        let closed = self.topic.clear().await;
        if closed > 0 {
            debug!(subscriptions = closed, "closed local subscriptions");
        }
        true
    }
}
