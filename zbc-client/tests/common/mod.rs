//! Common test utilities for integration tests: an in-process mock broker
//! cluster speaking the client protocol over loopback TCP.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use zbc_client::payload::{
    Broker, BrokerPartition, Deployment, OpenTopicSubscription, PartitionCollection,
    PartitionDetails, Task, TopicSubscriptionAck, TopologyResponse, WorkflowInstance,
};
use zbc_client::{ClientConfig, ClientConfigBuilder, MsgPackCodec, TaskSubscription, Topic};
use zbc_core::protocol::{
    ControlMessageRequest, ControlMessageResponse, ControlMessageType, EventType,
    ExecuteCommandRequest, ExecuteCommandResponse, Message, MessageCodec, SchemaBody,
    SubscribedEvent, SubscriptionType, NULL_U64,
};

/// A request the mock cluster received.
#[derive(Debug, Clone)]
pub enum Recorded {
    Command {
        broker: String,
        request: ExecuteCommandRequest,
    },
    Control {
        broker: String,
        request: ControlMessageRequest,
    },
}

#[derive(Debug, Clone)]
struct Leader {
    address: String,
    topic: String,
    partition_id: u16,
}

/// State shared by every broker of a mock cluster.
#[derive(Debug, Default)]
pub struct ClusterState {
    leaders: Mutex<Vec<Leader>>,
    recorded: Mutex<Vec<Recorded>>,
    tasks_to_push: Mutex<Vec<Task>>,
    topic_events_to_push: AtomicUsize,
    topology_requests: AtomicUsize,
    next_key: AtomicU64,
    reject_commands: AtomicBool,
    hang_up_on_command: AtomicBool,
    subscription_delay: Mutex<Option<Duration>>,
}

impl ClusterState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_key: AtomicU64::new(1000),
            ..Self::default()
        })
    }

    /// Makes the broker at `address` lead `topic`'s `partition_id`.
    pub fn lead(&self, address: &str, topic: &str, partition_id: u16) {
        self.leaders.lock().unwrap().push(Leader {
            address: address.to_string(),
            topic: topic.to_string(),
            partition_id,
        });
    }

    /// Tasks pushed to every task subscription right after it opens.
    pub fn push_tasks(&self, tasks: Vec<Task>) {
        *self.tasks_to_push.lock().unwrap() = tasks;
    }

    /// Number of events pushed to every topic subscription right after it opens.
    pub fn push_topic_events(&self, count: usize) {
        self.topic_events_to_push.store(count, Ordering::SeqCst);
    }

    pub fn reject_commands(&self, reject: bool) {
        self.reject_commands.store(reject, Ordering::SeqCst);
    }

    pub fn hang_up_on_command(&self, hang_up: bool) {
        self.hang_up_on_command.store(hang_up, Ordering::SeqCst);
    }

    /// Holds back the reply to the next task subscription open by `delay`.
    pub fn delay_next_subscription(&self, delay: Duration) {
        *self.subscription_delay.lock().unwrap() = Some(delay);
    }

    pub fn topology_requests(&self) -> usize {
        self.topology_requests.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(String, ExecuteCommandRequest)> {
        self.recorded()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Command { broker, request } => Some((broker, request)),
                _ => None,
            })
            .collect()
    }

    pub fn controls(&self, message_type: ControlMessageType) -> Vec<(String, ControlMessageRequest)> {
        self.recorded()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Control { broker, request } if request.message_type == message_type => {
                    Some((broker, request))
                }
                _ => None,
            })
            .collect()
    }

    fn topology(&self) -> TopologyResponse {
        let leaders = self.leaders.lock().unwrap().clone();
        let mut brokers: Vec<Broker> = Vec::new();
        for leader in leaders {
            let (host, port) = leader.address.rsplit_once(':').unwrap();
            let partition = BrokerPartition {
                state: "LEADER".into(),
                topic_name: leader.topic.clone(),
                partition_id: leader.partition_id,
            };
            match brokers.iter_mut().find(|b| b.addr() == leader.address) {
                Some(broker) => broker.partitions.push(partition),
                None => brokers.push(Broker {
                    host: host.to_string(),
                    port: port.parse().unwrap(),
                    partitions: vec![partition],
                }),
            }
        }
        TopologyResponse { brokers }
    }

    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }
}

/// One mock broker listening on loopback.
pub struct MockBroker {
    address: String,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(cluster: Arc<ClusterState>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let broker_address = address.clone();

        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let cluster = Arc::clone(&cluster);
                let address = broker_address.clone();
                tokio::spawn(serve(socket, cluster, address));
            }
        });

        Self {
            address,
            accept_task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(socket: TcpStream, cluster: Arc<ClusterState>, address: String) {
    let mut framed = Framed::new(socket, MessageCodec::new());

    while let Some(Ok(Ok(request))) = framed.next().await {
        let Some(request_id) = request.request_id() else {
            continue;
        };
        let replies = match request.body {
            SchemaBody::ControlMessageRequest(control) => {
                cluster.recorded.lock().unwrap().push(Recorded::Control {
                    broker: address.clone(),
                    request: control.clone(),
                });
                if control.message_type == ControlMessageType::AddTaskSubscription {
                    let delay = cluster.subscription_delay.lock().unwrap().take();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                handle_control(&cluster, request_id, control)
            }
            SchemaBody::ExecuteCommandRequest(command) => {
                cluster.recorded.lock().unwrap().push(Recorded::Command {
                    broker: address.clone(),
                    request: command.clone(),
                });
                if cluster.hang_up_on_command.load(Ordering::SeqCst) {
                    return;
                }
                handle_command(&cluster, request_id, command)
            }
            _ => continue,
        };

        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

fn control_reply(request_id: u64, data: Vec<u8>) -> Message {
    Message::request(
        request_id,
        ControlMessageResponse {
            data: Bytes::from(data),
        },
    )
}

fn handle_control(cluster: &ClusterState, request_id: u64, control: ControlMessageRequest) -> Vec<Message> {
    match control.message_type {
        ControlMessageType::RequestTopology => {
            cluster.topology_requests.fetch_add(1, Ordering::SeqCst);
            let topology = cluster.topology();
            vec![control_reply(request_id, MsgPackCodec::encode(&topology).unwrap())]
        }
        ControlMessageType::RequestPartitions => {
            let partitions = PartitionCollection {
                partitions: cluster
                    .leaders
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|l| PartitionDetails {
                        id: l.partition_id,
                        topic: l.topic.clone(),
                    })
                    .collect(),
            };
            vec![control_reply(request_id, MsgPackCodec::encode(&partitions).unwrap())]
        }
        ControlMessageType::AddTaskSubscription => {
            let mut subscription: TaskSubscription = MsgPackCodec::decode(&control.data).unwrap();
            subscription.subscriber_key = cluster.next_key();
            let mut replies = vec![control_reply(
                request_id,
                MsgPackCodec::encode(&subscription).unwrap(),
            )];

            let tasks = cluster.tasks_to_push.lock().unwrap().clone();
            for (position, mut task) in tasks.into_iter().enumerate() {
                task.state = "LOCKED".into();
                task.lock_owner = Some(subscription.lock_owner.clone());
                replies.push(Message::single(SubscribedEvent {
                    partition_id: subscription.partition_id,
                    position: position as u64,
                    key: cluster.next_key(),
                    subscriber_key: subscription.subscriber_key,
                    subscription_type: SubscriptionType::Task,
                    event_type: EventType::Task,
                    topic_name: subscription.topic_name.clone(),
                    event: Bytes::from(MsgPackCodec::encode(&task).unwrap()),
                }));
            }
            replies
        }
        _ => vec![control_reply(request_id, control.data.to_vec())],
    }
}

fn handle_command(cluster: &ClusterState, request_id: u64, command: ExecuteCommandRequest) -> Vec<Message> {
    let reject = cluster.reject_commands.load(Ordering::SeqCst);
    let key = if command.key == NULL_U64 {
        cluster.next_key()
    } else {
        command.key
    };

    let answered = |state: &str| -> String {
        if reject {
            format!("{}_REJECTED", command_state(&command))
        } else {
            state.to_string()
        }
    };

    let event = match command.event_type {
        EventType::Task => {
            let mut task: Task = MsgPackCodec::decode(&command.command).unwrap();
            task.state = answered(if task.state == "COMPLETE" { "COMPLETED" } else { "CREATED" });
            MsgPackCodec::encode(&task).unwrap()
        }
        EventType::WorkflowInstance => {
            let mut instance: WorkflowInstance = MsgPackCodec::decode(&command.command).unwrap();
            instance.state = answered("WORKFLOW_INSTANCE_CREATED");
            MsgPackCodec::encode(&instance).unwrap()
        }
        EventType::Topic => {
            let mut topic: Topic = MsgPackCodec::decode(&command.command).unwrap();
            topic.state = answered("CREATED");
            MsgPackCodec::encode(&topic).unwrap()
        }
        EventType::Deployment => {
            let mut deployment: Deployment = MsgPackCodec::decode(&command.command).unwrap();
            deployment.state = answered("CREATED");
            MsgPackCodec::encode(&deployment).unwrap()
        }
        EventType::Subscriber => {
            let mut open: OpenTopicSubscription = MsgPackCodec::decode(&command.command).unwrap();
            open.state = answered("SUBSCRIBED");
            MsgPackCodec::encode(&open).unwrap()
        }
        EventType::Subscription => {
            let mut ack: TopicSubscriptionAck = MsgPackCodec::decode(&command.command).unwrap();
            ack.state = answered("ACKNOWLEDGED");
            MsgPackCodec::encode(&ack).unwrap()
        }
        _ => command.command.to_vec(),
    };

    let mut replies = vec![Message::request(
        request_id,
        ExecuteCommandResponse {
            partition_id: command.partition_id,
            key,
            topic_name: command.topic_name.clone(),
            event: Bytes::from(event),
        },
    )];

    if command.event_type == EventType::Subscriber && !reject {
        for position in 0..cluster.topic_events_to_push.load(Ordering::SeqCst) {
            let instance = WorkflowInstance::new("order-process");
            replies.push(Message::single(SubscribedEvent {
                partition_id: command.partition_id,
                position: position as u64,
                key: cluster.next_key(),
                subscriber_key: key,
                subscription_type: SubscriptionType::Topic,
                event_type: EventType::WorkflowInstance,
                topic_name: command.topic_name.clone(),
                event: Bytes::from(MsgPackCodec::encode(&instance).unwrap()),
            }));
        }
    }
    replies
}

fn command_state(command: &ExecuteCommandRequest) -> String {
    #[derive(serde::Deserialize, Default)]
    #[serde(default)]
    struct State {
        state: String,
    }
    MsgPackCodec::decode::<State>(&command.command)
        .map(|s| s.state)
        .unwrap_or_default()
}

/// A client config pointed at `address` with test-friendly timings.
pub fn test_config(address: &str) -> ClientConfig {
    test_config_builder(address)
        .build()
        .expect("failed to build config")
}

/// The builder behind [`test_config`], for tests that tweak it further.
pub fn test_config_builder(address: &str) -> ClientConfigBuilder {
    ClientConfigBuilder::new()
        .bootstrap_address(address)
        .network(|n| {
            n.connection_timeout(Duration::from_secs(1))
                .request_timeout(Duration::from_secs(1))
                .read_poll_interval(Duration::from_millis(50))
        })
        .retry(|r| {
            r.initial_backoff(Duration::from_millis(5))
                .max_backoff(Duration::from_millis(50))
                .deadline(Duration::from_millis(500))
        })
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
