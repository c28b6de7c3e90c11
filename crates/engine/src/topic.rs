//! In-process registry and fan-out broadcast
//!
//! The topic owns its subscriptions from creation until removal. Fan-out is
//! parallel so a slow consumer cannot delay delivery to fast ones, and the
//! registry is self-pruning: any subscription whose publish fails terminally
//! is removed during the same broadcast sweep. The registry is the one piece
//! of shared mutable state touched from both the serialized apply path and
//! the unserialized lookup/streaming path, so all access goes through the
//! internal lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::command::Event;
use crate::error::{EngineResult, Error};
use crate::subscription::{DeliveryMode, Subscription, SubscriptionError};
use crate::types::{ReplicaId, SubscriptionId};

/// Factory for creating new subscriptions
pub type SubscriptionFactory = Arc<dyn Fn(SubscriptionId) -> Arc<Subscription> + Send + Sync>;

/// Configuration for a topic registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Outbound channel capacity per subscription
    pub channel_capacity: usize,
    /// Delivery mode for publishes
    pub delivery: DeliveryMode,
    /// Remove subscriptions that never reach `Listening` within this window;
    /// `None` disables the timer
    pub abandonment_timeout: Option<Duration>,
    /// Sentinel event emitted to a listener when its subscription closes
    pub exit_event: Option<Event>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            delivery: DeliveryMode::Sync,
            abandonment_timeout: Some(Duration::from_secs(30)),
            exit_event: None,
        }
    }
}

/// The in-process broker: registry of subscriptions plus fan-out broadcast
pub struct Topic {
    /// Replica that owns this registry's channels
    replica_id: ReplicaId,
    config: TopicConfig,
    factory: SubscriptionFactory,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
}

impl Topic {
    /// Create a topic whose factory builds subscriptions from the config
    pub fn new(replica_id: ReplicaId, config: TopicConfig) -> Arc<Self> {
        let capacity = config.channel_capacity;
        let delivery = config.delivery;
        let exit_event = config.exit_event.clone();
        let factory: SubscriptionFactory = Arc::new(move |id| {
            Subscription::new(id, capacity, delivery, exit_event.clone())
        });
        Self::with_factory(replica_id, config, factory)
    }

    /// Create a topic with an injected subscription factory
    pub fn with_factory(
        replica_id: ReplicaId,
        config: TopicConfig,
        factory: SubscriptionFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            replica_id,
            config,
            factory,
            subscriptions: RwLock::new(HashMap::new()),
        })
    }

    /// The replica that owns this registry
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Create and register a new subscription
    ///
    /// The subscription is not yet activated; that happens when the
    /// committed `start-subscription` command reaches this replica. If an
    /// abandonment timeout is configured and the subscription has not
    /// reached `Listening` by then, it is removed and never activated.
    pub async fn subscribe(self: &Arc<Self>) -> (SubscriptionId, Arc<Subscription>) {
        let mut registry = self.subscriptions.write().await;
        let (id, subscription) = loop {
            let id = SubscriptionId::new();
            if !registry.contains_key(&id) {
                let subscription = (self.factory)(id);
                registry.insert(id, subscription.clone());
                break (id, subscription);
            }
            // uuid collision; allocate again
        };
        drop(registry);

        debug!(subscription = %id, "subscription registered");

        if let Some(timeout) = self.config.abandonment_timeout {
            let topic = Arc::clone(self);
            let sub = subscription.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !sub.is_listening() && !sub.is_closed() {
                    warn!(subscription = %id, "subscription never listened, evicting");
                    topic.remove_subscription(&id).await;
                }
            });
        }

        (id, subscription)
    }

    /// Look up a subscription by its wire-form (string) key
    pub async fn get_subscription(&self, id: &str) -> EngineResult<Arc<Subscription>> {
        let id = SubscriptionId::parse(id)
            .map_err(|_| Error::validation(format!("malformed subscription id: {id}")))?;
        self.get(&id).await
    }

    /// Look up a subscription by id
    pub async fn get(&self, id: &SubscriptionId) -> EngineResult<Arc<Subscription>> {
        self.subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("subscription {id}")))
    }

    /// Publish an event to every registered subscription in parallel
    ///
    /// One task per subscription, joined before returning. Subscriptions
    /// whose publish failed terminally are removed; `NotStarted` is expected
    /// before activation and leaves the subscription registered. Returns the
    /// number of subscriptions that accepted the event.
    pub async fn broadcast(&self, event: Event) -> EngineResult<usize> {
        let targets: Vec<(SubscriptionId, Arc<Subscription>)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect();

        let mut tasks = JoinSet::new();
        for (id, sub) in targets {
            let event = event.clone();
            tasks.spawn(async move { (id, sub.publish(event).await) });
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = joined?;
            match result {
                Ok(()) => delivered += 1,
                Err(SubscriptionError::NotStarted) => {
                    debug!(subscription = %id, "skipping unstarted subscription");
                }
                Err(err) => {
                    debug!(subscription = %id, %err, "pruning dead subscription");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.subscriptions.write().await;
            for id in dead {
                if let Some(sub) = registry.remove(&id) {
                    sub.close();
                }
            }
        }

        Ok(delivered)
    }

    /// Remove and close a subscription; idempotent
    pub async fn remove_subscription(&self, id: &SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().await.remove(id) {
            sub.close();
            debug!(subscription = %id, "subscription removed");
        }
    }

    /// Number of currently registered subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Close and remove every subscription; returns how many were closed
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = self.subscriptions.write().await.drain().collect();
        let count = drained.len();
        for (_, sub) in drained {
            sub.close();
        }
        count
    }
}
