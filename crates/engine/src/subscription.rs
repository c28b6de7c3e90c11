//! One consumer's channel-backed listener
//!
//! A subscription moves through `Created -> Started -> Closed`, with an
//! intermediate `Listening` once the consumer has taken the read side of the
//! channel; it never regresses. Creation happens locally via
//! [`crate::topic::Topic::subscribe`]; activation happens when the replica
//! that originated the subscribe request applies the committed
//! `start-subscription` command. Publishes before activation are rejected
//! with [`SubscriptionError::NotStarted`] - they are neither queued nor
//! silently dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::Event;
use crate::types::SubscriptionId;

/// How publishes hand events to the subscriber channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Await channel capacity; a full buffer blocks the publisher, which is
    /// the natural backpressure of the bounded channel
    #[default]
    Sync,
    /// Never block the publisher; when the buffer is full the event is
    /// dropped and counted. This is the documented bounded-queue policy for
    /// slow consumers, chosen over spawning a detached send per publish.
    Async,
}

/// Errors from subscription operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscription was never activated by a committed
    /// `start-subscription` command; transient, not a dead listener
    #[error("subscription not started")]
    NotStarted,

    /// The subscription channel is closed; terminal
    #[error("subscription closed")]
    Closed,

    /// The read side of the channel was already taken
    #[error("subscription already listening")]
    AlreadyListening,
}

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const LISTENING: u8 = 2;
const CLOSED: u8 = 3;

/// A single consumer's local, non-replicated listener
pub struct Subscription {
    id: SubscriptionId,
    mode: DeliveryMode,
    exit_event: Option<Event>,
    tx: flume::Sender<Event>,
    rx: Mutex<Option<flume::Receiver<Event>>>,
    state: AtomicU8,
    dropped: AtomicU64,
}

impl Subscription {
    /// Create a subscription with a bounded channel of the given capacity
    pub fn new(
        id: SubscriptionId,
        capacity: usize,
        mode: DeliveryMode,
        exit_event: Option<Event>,
    ) -> Arc<Self> {
        let (tx, rx) = flume::bounded(capacity);
        Arc::new(Self {
            id,
            mode,
            exit_event,
            tx,
            rx: Mutex::new(Some(rx)),
            state: AtomicU8::new(CREATED),
            dropped: AtomicU64::new(0),
        })
    }

    /// The subscription's registry key
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Idempotent activation; must happen before `publish` succeeds
    pub fn start(&self) {
        let _ = self
            .state
            .compare_exchange(CREATED, STARTED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Enqueue an event onto the outbound channel
    ///
    /// Fails with `Closed` if the subscription was closed and with
    /// `NotStarted` if it was never activated. In [`DeliveryMode::Async`] a
    /// full buffer drops the event instead of blocking; drops are observable
    /// via [`Subscription::dropped`].
    pub async fn publish(&self, event: Event) -> Result<(), SubscriptionError> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => return Err(SubscriptionError::Closed),
            CREATED => return Err(SubscriptionError::NotStarted),
            _ => {}
        }

        match self.mode {
            DeliveryMode::Sync => {
                if self.tx.send_async(event).await.is_err() {
                    self.state.store(CLOSED, Ordering::Release);
                    return Err(SubscriptionError::Closed);
                }
            }
            DeliveryMode::Async => match self.tx.try_send(event) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        subscription = %self.id,
                        dropped = total,
                        "subscriber buffer full, event dropped"
                    );
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.state.store(CLOSED, Ordering::Release);
                    return Err(SubscriptionError::Closed);
                }
            },
        }

        Ok(())
    }

    /// Take the read side of the outbound channel
    ///
    /// Spawns a watcher that closes the subscription when `cancel` fires,
    /// emitting the sentinel exit event first if one is configured. Must be
    /// called after activation and at most once.
    pub fn listen(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<flume::Receiver<Event>, SubscriptionError> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => return Err(SubscriptionError::Closed),
            CREATED => return Err(SubscriptionError::NotStarted),
            _ => {}
        }

        let rx = self
            .rx
            .lock()
            .take()
            .ok_or(SubscriptionError::AlreadyListening)?;

        self.state.store(LISTENING, Ordering::Release);

        let sub = Arc::clone(self);
        tokio::spawn(async move {
            cancel.cancelled().await;
            debug!(subscription = %sub.id, "listener cancelled, closing subscription");
            sub.close();
        });

        Ok(rx)
    }

    /// Close the subscription; idempotent
    ///
    /// Emits the sentinel exit event (best effort) on the first close so a
    /// listener can tell a deliberate shutdown from a dropped registry.
    pub fn close(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous != CLOSED
            && let Some(exit) = &self.exit_event
        {
            let _ = self.tx.try_send(exit.clone());
        }
    }

    /// Whether `start` has been applied
    pub fn is_started(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        state == STARTED || state == LISTENING
    }

    /// Whether a listener holds the read side
    pub fn is_listening(&self) -> bool {
        self.state.load(Ordering::Acquire) == LISTENING
    }

    /// Whether the subscription is closed
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Events dropped under the async delivery policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WIRE_VERSION;

    fn event(id: u64, body: &str) -> Event {
        Event {
            id,
            name: "publish-message".to_string(),
            version: WIRE_VERSION,
            data: serde_json::json!({ "body": body }),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let sub = Subscription::new(SubscriptionId::new(), 4, DeliveryMode::Sync, None);
        assert_eq!(
            sub.publish(event(1, "early")).await,
            Err(SubscriptionError::NotStarted)
        );
        assert!(!sub.is_started());
    }

    #[tokio::test]
    async fn publish_after_start_delivers() {
        let sub = Subscription::new(SubscriptionId::new(), 4, DeliveryMode::Sync, None);
        sub.start();
        sub.start(); // idempotent

        sub.publish(event(1, "a")).await.unwrap();

        let cancel = CancellationToken::new();
        let rx = sub.listen(cancel).unwrap();
        assert_eq!(rx.recv_async().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let sub = Subscription::new(SubscriptionId::new(), 4, DeliveryMode::Sync, None);
        sub.start();
        let _rx = sub.listen(CancellationToken::new()).unwrap();
        assert_eq!(
            sub.listen(CancellationToken::new()).err(),
            Some(SubscriptionError::AlreadyListening)
        );
    }

    #[tokio::test]
    async fn async_mode_drops_when_full() {
        let sub = Subscription::new(SubscriptionId::new(), 1, DeliveryMode::Async, None);
        sub.start();

        sub.publish(event(1, "kept")).await.unwrap();
        sub.publish(event(2, "dropped")).await.unwrap();

        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn cancel_emits_sentinel_and_closes() {
        let exit = event(0, "goodbye");
        let sub = Subscription::new(
            SubscriptionId::new(),
            4,
            DeliveryMode::Sync,
            Some(exit.clone()),
        );
        sub.start();

        let cancel = CancellationToken::new();
        let rx = sub.listen(cancel.clone()).unwrap();

        cancel.cancel();
        let got = rx.recv_async().await.unwrap();
        assert_eq!(got, exit);

        // Closing is observable to publishers once the watcher ran
        while !sub.is_closed() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            sub.publish(event(3, "late")).await,
            Err(SubscriptionError::Closed)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let exit = event(0, "bye");
        let sub = Subscription::new(
            SubscriptionId::new(),
            4,
            DeliveryMode::Sync,
            Some(exit.clone()),
        );
        sub.start();
        let rx = sub.listen(CancellationToken::new()).unwrap();

        sub.close();
        sub.close();

        // Only one sentinel despite two closes
        assert_eq!(rx.recv_async().await.unwrap(), exit);
        assert!(rx.try_recv().is_err());
    }
}
