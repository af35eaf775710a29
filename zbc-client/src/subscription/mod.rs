//! Task and topic subscriptions.
//!
//! Events pushed by brokers are routed by [`SubscriptionDispatcher`] on the
//! connection they arrive on, then merged across partitions into one
//! [`EventStream`] per subscription.

mod dispatcher;

pub use dispatcher::{DispatchOutcome, SubscriptionDispatcher};

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};

use zbc_core::protocol::{EventType, SubscribedEvent};

use crate::payload::{Task, TaskSubscription};

/// Kind of subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Locked tasks of one type, flow controlled by credits.
    Task,
    /// Every event of a topic, flow controlled by acknowledgements.
    Topic,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::Task => write!(f, "task"),
            SubscriptionKind::Topic => write!(f, "topic"),
        }
    }
}

/// An event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    /// Subscription kind the event was delivered for.
    pub kind: SubscriptionKind,
    /// The pushed event as received.
    pub event: SubscribedEvent,
    /// Decoded task record, set for task subscriptions when the payload decodes.
    pub task: Option<Task>,
}

impl SubscriptionEvent {
    /// Returns the record key.
    pub fn key(&self) -> u64 {
        self.event.key
    }

    /// Returns the log position.
    pub fn position(&self) -> u64 {
        self.event.position
    }

    /// Returns the partition the event was written to.
    pub fn partition_id(&self) -> u16 {
        self.event.partition_id
    }

    /// Returns the subscriber key the broker pushed the event for.
    pub fn subscriber_key(&self) -> u64 {
        self.event.subscriber_key
    }

    /// Returns the topic the event was written to.
    pub fn topic_name(&self) -> &str {
        &self.event.topic_name
    }

    /// Returns the event type.
    pub fn event_type(&self) -> EventType {
        self.event.event_type
    }

    /// Returns the msgpack-encoded record.
    pub fn payload(&self) -> &[u8] {
        &self.event.event
    }
}

/// Merged stream of events from every partition of one subscription.
///
/// Ends once the subscription is closed or every partition's connection is
/// gone.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<SubscriptionEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::Receiver<SubscriptionEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next event, or `None` when the stream has ended.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Receives an event if one is buffered.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Subscription state for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSubscription {
    /// Partition the subscription is open on.
    pub partition_id: u16,
    /// Key assigned by the broker.
    pub subscriber_key: u64,
    /// Broker connection the events arrive on.
    pub address: String,
    /// Task subscription as acknowledged by the broker, for task subscriptions.
    pub task: Option<TaskSubscription>,
}

/// Handle to an open subscription, passed back to close it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    kind: SubscriptionKind,
    topic: String,
    name: String,
    partitions: Vec<PartitionSubscription>,
    active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        kind: SubscriptionKind,
        topic: impl Into<String>,
        name: impl Into<String>,
        partitions: Vec<PartitionSubscription>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            kind,
            topic: topic.into(),
            name: name.into(),
            partitions,
            active: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
        }
    }

    /// Returns the subscription kind.
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Returns the subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the topic subscription name, or the task type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the per-partition state.
    pub fn partitions(&self) -> &[PartitionSubscription] {
        &self.partitions
    }

    /// Returns true until the subscription is closed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops the forwarding tasks.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
