//! Task and topic subscription tests against an in-process broker cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, test_config, test_config_builder, ClusterState, MockBroker};
use zbc_client::payload::TopicSubscriptionAck;
use zbc_client::{
    EventStream, MsgPackCodec, SubscriptionEvent, SubscriptionKind, Task, TaskSubscription,
    ZbcClient, ZbcError,
};
use zbc_core::protocol::{ControlMessageType, EventType};

async fn cluster_with(topic: &str, partitions: &[u16]) -> (Arc<ClusterState>, MockBroker, ZbcClient) {
    let cluster = ClusterState::new();
    let broker = MockBroker::start(cluster.clone()).await;
    for partition in partitions {
        cluster.lead(broker.address(), topic, *partition);
    }
    let client = ZbcClient::connect(test_config(broker.address())).await.unwrap();
    (cluster, broker, client)
}

async fn collect(stream: &mut EventStream, count: usize) -> Vec<SubscriptionEvent> {
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended early");
        events.push(event);
    }
    events
}

/// Positions of the acknowledgements the cluster received, in arrival order.
fn acked_positions(cluster: &ClusterState) -> Vec<u64> {
    cluster
        .commands()
        .into_iter()
        .filter(|(_, r)| r.event_type == EventType::Subscription)
        .map(|(_, r)| {
            MsgPackCodec::decode::<TopicSubscriptionAck>(&r.command)
                .unwrap()
                .ack_position
        })
        .collect()
}

#[tokio::test]
async fn test_task_subscription_delivers_every_partition() {
    let (cluster, _broker, client) = cluster_with("orders", &[1, 2]).await;
    cluster.push_tasks(vec![Task::new("payment"); 4]);

    let (mut tasks, handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 4)
        .await
        .unwrap();
    assert_eq!(handle.kind(), SubscriptionKind::Task);
    assert_eq!(handle.partitions().len(), 2);

    let events = collect(&mut tasks, 8).await;
    for partition_id in [1, 2] {
        assert_eq!(
            events.iter().filter(|e| e.partition_id() == partition_id).count(),
            4
        );
    }
    for event in &events {
        assert_eq!(event.kind, SubscriptionKind::Task);
        assert_eq!(event.topic_name(), "orders");
        let task = event.task.as_ref().expect("task events carry a decoded task");
        assert_eq!(task.state, "LOCKED");
        assert_eq!(task.lock_owner.as_deref(), Some("worker-1"));
    }

    let added = cluster.controls(ControlMessageType::AddTaskSubscription);
    assert_eq!(added.len(), 2);

    client.close_subscription(handle).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_consumed_tasks_grant_credits() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;
    cluster.push_tasks(vec![Task::new("payment"); 4]);

    let (mut tasks, handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 4)
        .await
        .unwrap();
    collect(&mut tasks, 4).await;

    assert!(
        eventually(Duration::from_secs(2), || {
            !cluster
                .controls(ControlMessageType::IncreaseTaskSubscriptionCredits)
                .is_empty()
        })
        .await
    );

    client.close_subscription(handle).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_complete_task_targets_origin() {
    let (cluster, _broker, client) = cluster_with("orders", &[3]).await;
    cluster.push_tasks(vec![Task::new("payment")]);

    let (mut tasks, handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 2)
        .await
        .unwrap();
    let event = collect(&mut tasks, 1).await.remove(0);

    let completed = client.complete_task(&event).await.unwrap();
    assert_eq!(completed.state, "COMPLETED");

    let (_, request) = cluster
        .commands()
        .into_iter()
        .find(|(_, r)| r.event_type == EventType::Task)
        .unwrap();
    assert_eq!(request.key, event.key());
    assert_eq!(request.partition_id, 3);

    client.close_subscription(handle).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_close_task_subscription() {
    let (cluster, _broker, client) = cluster_with("orders", &[1, 2]).await;

    let (mut tasks, handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 8)
        .await
        .unwrap();
    let subscriber_keys: Vec<u64> = handle.partitions().iter().map(|p| p.subscriber_key).collect();
    let active = handle.is_active();

    client.close_subscription(handle).await.unwrap();
    assert!(active);

    let removed = cluster.controls(ControlMessageType::RemoveTaskSubscription);
    assert_eq!(removed.len(), 2);

    let stream_end = tokio::time::timeout(Duration::from_secs(2), tasks.recv()).await;
    assert!(matches!(stream_end, Ok(None)));
    assert_eq!(subscriber_keys.len(), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn test_subscription_accepted_after_timeout_is_closed() {
    let cluster = ClusterState::new();
    let broker = MockBroker::start(cluster.clone()).await;
    cluster.lead(broker.address(), "orders", 1);
    let config = test_config_builder(broker.address())
        .request_timeout(Duration::from_millis(300))
        .retry(|r| {
            r.initial_backoff(Duration::from_millis(5))
                .max_backoff(Duration::from_millis(50))
                .deadline(Duration::from_secs(3))
        })
        .build()
        .unwrap();
    let client = ZbcClient::connect(config).await.unwrap();
    cluster.delay_next_subscription(Duration::from_millis(400));

    let (_tasks, handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 4)
        .await
        .unwrap();
    let live_key = handle.partitions()[0].subscriber_key;
    assert_eq!(cluster.controls(ControlMessageType::AddTaskSubscription).len(), 2);

    let removed_keys = || {
        cluster
            .controls(ControlMessageType::RemoveTaskSubscription)
            .into_iter()
            .map(|(_, r)| {
                MsgPackCodec::decode::<TaskSubscription>(&r.data)
                    .unwrap()
                    .subscriber_key
            })
            .collect::<Vec<_>>()
    };
    assert!(eventually(Duration::from_secs(2), || removed_keys().len() == 1).await);
    let orphan = removed_keys()[0];
    assert_ne!(orphan, live_key);
    assert!(handle.is_active());

    client.close_subscription(handle).await.unwrap();
    assert_eq!(removed_keys(), vec![orphan, live_key]);
    client.shutdown().await;
}

#[tokio::test]
async fn test_zero_credits_is_rejected_locally() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;

    let err = client
        .open_task_subscription("orders", "worker-1", "payment", 0)
        .await
        .unwrap_err();

    assert!(matches!(err, ZbcError::Configuration(_)));
    assert!(cluster
        .controls(ControlMessageType::AddTaskSubscription)
        .is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn test_topic_subscription_acknowledges_events() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;
    cluster.push_topic_events(3);

    let (mut events, handle) = client
        .open_topic_subscription("orders", "tail", 0)
        .await
        .unwrap();
    assert_eq!(handle.kind(), SubscriptionKind::Topic);
    let subscriber_key = handle.partitions()[0].subscriber_key;

    let received = collect(&mut events, 3).await;
    let positions: Vec<u64> = received.iter().map(|e| e.position()).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    assert!(received
        .iter()
        .all(|e| e.event_type() == EventType::WorkflowInstance && e.task.is_none()));

    assert!(
        eventually(Duration::from_secs(2), || {
            acked_positions(&cluster).last() == Some(&2)
        })
        .await
    );
    let positions = acked_positions(&cluster);
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    assert!(cluster
        .commands()
        .iter()
        .filter(|(_, r)| r.event_type == EventType::Subscription)
        .all(|(_, r)| r.key == subscriber_key && r.partition_id == 1));

    client.close_subscription(handle).await.unwrap();
    assert_eq!(
        cluster
            .controls(ControlMessageType::RemoveTopicSubscription)
            .len(),
        1
    );
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_topic_acks_never_go_backwards() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;
    cluster.push_topic_events(300);

    let (mut events, handle) = client
        .open_topic_subscription("orders", "tail", 0)
        .await
        .unwrap();
    let received = collect(&mut events, 300).await;
    assert_eq!(received.last().map(|e| e.position()), Some(299));

    assert!(
        eventually(Duration::from_secs(5), || {
            acked_positions(&cluster).last() == Some(&299)
        })
        .await
    );
    let positions = acked_positions(&cluster);
    assert!(!positions.is_empty());
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "acknowledged positions went backwards: {positions:?}"
    );

    client.close_subscription(handle).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_rejected_topic_subscription() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;
    cluster.reject_commands(true);

    let err = client
        .open_topic_subscription("orders", "tail", 0)
        .await
        .unwrap_err();

    assert!(matches!(err, ZbcError::Rejected(_)));
    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_streams() {
    let (cluster, _broker, client) = cluster_with("orders", &[1]).await;
    cluster.push_tasks(vec![Task::new("payment")]);

    let (mut tasks, _handle) = client
        .open_task_subscription("orders", "worker-1", "payment", 4)
        .await
        .unwrap();
    collect(&mut tasks, 1).await;

    client.shutdown().await;
    let end = tokio::time::timeout(Duration::from_secs(2), tasks.recv()).await;
    assert!(matches!(end, Ok(None)));
}
