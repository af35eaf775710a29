//! Routing of pushed subscription events to their consumers.

use dashmap::DashMap;
use tokio::sync::mpsc;

use zbc_core::protocol::SubscribedEvent;

use super::{SubscriptionEvent, SubscriptionKind};
use crate::payload::{MsgPackCodec, Task};

#[derive(Debug, Clone)]
struct Registration {
    kind: SubscriptionKind,
    sender: mpsc::Sender<SubscriptionEvent>,
}

/// What happened to a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the consumer channel.
    Delivered,
    /// No subscription is registered under the key; the event was dropped.
    UnknownSubscriber,
    /// The consumer went away; the subscription was unregistered.
    ConsumerClosed,
}

/// Maps subscriber keys to bounded delivery channels.
///
/// One dispatcher belongs to one connection. A full channel makes
/// [`SubscriptionDispatcher::dispatch`] wait, which stalls the connection's
/// reader task until the consumer catches up.
#[derive(Debug, Default)]
pub struct SubscriptionDispatcher {
    subscriptions: DashMap<u64, Registration>,
}

impl SubscriptionDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and returns its delivery channel.
    ///
    /// A previous registration under the same key is replaced.
    pub fn register(
        &self,
        subscriber_key: u64,
        kind: SubscriptionKind,
        capacity: usize,
    ) -> mpsc::Receiver<SubscriptionEvent> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.register_sender(subscriber_key, kind, sender);
        receiver
    }

    /// Registers a subscription on a channel created by the caller.
    pub fn register_sender(
        &self,
        subscriber_key: u64,
        kind: SubscriptionKind,
        sender: mpsc::Sender<SubscriptionEvent>,
    ) {
        let capacity = sender.max_capacity();
        if self
            .subscriptions
            .insert(subscriber_key, Registration { kind, sender })
            .is_some()
        {
            tracing::warn!(subscriber_key, "replaced existing subscription registration");
        }
        tracing::debug!(subscriber_key, ?kind, capacity, "registered subscription");
    }

    /// Removes a subscription. Returns true if it was registered.
    pub fn unregister(&self, subscriber_key: u64) -> bool {
        let removed = self.subscriptions.remove(&subscriber_key).is_some();
        if removed {
            tracing::debug!(subscriber_key, "unregistered subscription");
        }
        removed
    }

    /// Returns true if a subscription is registered under the key.
    pub fn contains(&self, subscriber_key: u64) -> bool {
        self.subscriptions.contains_key(&subscriber_key)
    }

    /// Returns the number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if no subscription is registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drops every registration, ending all delivery channels.
    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    /// Delivers an event to the subscription named by its subscriber key.
    pub async fn dispatch(&self, event: SubscribedEvent) -> DispatchOutcome {
        let subscriber_key = event.subscriber_key;

        // Clone out of the map so no shard lock is held while waiting on the channel.
        let registration = match self.subscriptions.get(&subscriber_key) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::trace!(
                    subscriber_key,
                    position = event.position,
                    "dropping event for unknown subscriber"
                );
                return DispatchOutcome::UnknownSubscriber;
            }
        };

        let task = match registration.kind {
            SubscriptionKind::Task => match MsgPackCodec::decode::<Task>(&event.event) {
                Ok(task) => Some(task),
                Err(err) => {
                    tracing::warn!(subscriber_key, key = event.key, error = %err, "failed to decode task payload");
                    None
                }
            },
            SubscriptionKind::Topic => None,
        };

        let delivered = SubscriptionEvent {
            kind: registration.kind,
            event,
            task,
        };
        if registration.sender.send(delivered).await.is_err() {
            self.subscriptions
                .remove_if(&subscriber_key, |_, current| {
                    current.sender.same_channel(&registration.sender)
                });
            tracing::debug!(subscriber_key, "consumer closed, unregistered subscription");
            return DispatchOutcome::ConsumerClosed;
        }
        DispatchOutcome::Delivered
    }
}
