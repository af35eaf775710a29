//! Client entry point.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::instrument;

use zbc_core::protocol::{
    ControlMessageRequest, ControlMessageResponse, ControlMessageType, EventType,
    ExecuteCommandRequest, ExecuteCommandResponse, Message, SchemaBody, NULL_U16,
};
use zbc_core::{Result, ZbcError};

use crate::cluster::{ClusterTopology, Router, TopologyFetcher};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::payload::{
    CloseTopicSubscription, Deployment, EmptyRequest, MsgPackCodec, OpenTopicSubscription,
    PartitionCollection, RecordState, Resource, Task, TaskSubscription, Topic,
    TopicSubscriptionAck, WorkflowInstance, STATE_ACKNOWLEDGE, STATE_COMPLETE, STATE_CREATE,
    STATE_SUBSCRIBE,
};
use crate::retry::RetryPolicy;
use crate::subscription::{
    EventStream, PartitionSubscription, SubscriptionEvent, SubscriptionHandle, SubscriptionKind,
};
use crate::transaction::ResponseHook;

/// Topic that holds cluster-wide records such as topic creation.
pub const SYSTEM_TOPIC: &str = "internal-system";
/// Partition of [`SYSTEM_TOPIC`] that accepts commands.
pub const SYSTEM_PARTITION: u16 = 0;

/// The main entry point for talking to a broker cluster.
///
/// `ZbcClient` keeps one connection per broker, routes each command to the
/// leader of a partition of its topic and retries retryable failures until
/// the configured deadline. Cloning is cheap; clones share connections.
///
/// # Example
///
/// ```no_run
/// use zbc_client::{Task, ZbcClient};
///
/// # async fn run() -> zbc_client::Result<()> {
/// let client = ZbcClient::connect_to("127.0.0.1:51015").await?;
/// let task = client.create_task("default-topic", Task::new("payment")).await?;
/// println!("created task in state {}", task.state);
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ZbcClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    connections: Arc<ConnectionManager>,
    router: Arc<Router>,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
}

/// Flow control applied by a subscription forwarder.
#[derive(Debug, Clone)]
enum FlowControl {
    /// Grant credits back once half of them were used.
    Credits { granted: u32 },
    /// Acknowledge every forwarded event.
    Acknowledge { name: String },
}

impl ZbcClient {
    /// Connects using `config` and loads the initial topology.
    ///
    /// # Errors
    ///
    /// Returns [`ZbcError::RetryDeadlineReached`] if no topology could be
    /// fetched from the bootstrap broker within the retry deadline.
    #[instrument(
        name = "zbc_client.connect",
        skip(config),
        fields(bootstrap = %config.network().bootstrap_address())
    )]
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connections = Arc::new(ConnectionManager::new(config.network().clone()));
        let fetcher: Arc<dyn TopologyFetcher> = Arc::clone(&connections) as _;
        let router = Arc::new(Router::new(
            fetcher,
            config.network().bootstrap_address(),
            config.topology().refresh_interval(),
        ));
        let retry = RetryPolicy::from_config(config.retry());

        let topology = match retry.retry(|_| router.refresh()).await {
            Ok(topology) => topology,
            Err(err) => {
                connections.close_all().await;
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if config.topology().background_refresh() {
            router.spawn_refresh_task(shutdown_rx);
        }

        tracing::info!(
            brokers = topology.brokers().len(),
            partitions = topology.partition_count(),
            "connected to broker cluster"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connections,
                router,
                retry,
                shutdown_tx,
            }),
        })
    }

    /// Connects to `bootstrap_address` with default settings.
    pub async fn connect_to(bootstrap_address: impl Into<String>) -> Result<Self> {
        let config = ClientConfig::builder()
            .bootstrap_address(bootstrap_address)
            .build()?;
        Self::connect(config).await
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the connection pool.
    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Sends a command to a partition of `topic` and returns the raw response.
    ///
    /// The partition is picked round-robin unless `request` names one. The
    /// request's topic name is set to `topic`.
    pub async fn send_command(&self, topic: &str, request: ExecuteCommandRequest) -> Result<Message> {
        self.inner.send_command(topic, request).await
    }

    /// Opens a task subscription on every partition of `topic`.
    ///
    /// The broker pushes up to `credits` locked tasks per partition; credits
    /// are granted back as tasks are consumed from the stream.
    #[instrument(name = "zbc_client.open_task_subscription", skip(self))]
    pub async fn open_task_subscription(
        &self,
        topic: &str,
        lock_owner: &str,
        task_type: &str,
        credits: u32,
    ) -> Result<(EventStream, SubscriptionHandle)> {
        if credits == 0 {
            return Err(ZbcError::Configuration(
                "task subscription credits must be positive".to_string(),
            ));
        }
        let credits = credits.min(i32::MAX as u32);
        let lock_duration = self.inner.config.subscription().task_lock_duration();
        let template = TaskSubscription {
            subscriber_key: 0,
            topic_name: topic.to_string(),
            partition_id: 0,
            task_type: task_type.to_string(),
            lock_duration: lock_duration.as_millis().min(u64::MAX as u128) as u64,
            lock_owner: lock_owner.to_string(),
            credits: credits as i32,
        };

        self.inner
            .open_subscription(
                SubscriptionKind::Task,
                topic,
                task_type,
                credits as usize,
                FlowControl::Credits { granted: credits },
                |inner, partition_id, capacity| {
                    let mut subscription = template.clone();
                    subscription.partition_id = partition_id;
                    async move { inner.open_task_partition(subscription, capacity).await }
                },
            )
            .await
    }

    /// Opens a topic subscription named `name` on every partition of `topic`.
    ///
    /// Each forwarded event is acknowledged with its position.
    #[instrument(name = "zbc_client.open_topic_subscription", skip(self))]
    pub async fn open_topic_subscription(
        &self,
        topic: &str,
        name: &str,
        start_position: i64,
    ) -> Result<(EventStream, SubscriptionHandle)> {
        let capacity = self.inner.config.subscription().topic_capacity();
        let open = OpenTopicSubscription {
            start_position,
            prefetch_capacity: capacity.min(i32::MAX as usize) as i32,
            name: name.to_string(),
            force_start: false,
            state: STATE_SUBSCRIBE.to_string(),
        };
        let command = Bytes::from(MsgPackCodec::encode(&open)?);

        self.inner
            .open_subscription(
                SubscriptionKind::Topic,
                topic,
                name,
                capacity,
                FlowControl::Acknowledge {
                    name: name.to_string(),
                },
                |inner, partition_id, capacity| {
                    let request = ExecuteCommandRequest::new(topic, EventType::Subscriber, command.clone())
                        .with_partition(partition_id);
                    async move { inner.open_topic_partition(request, capacity).await }
                },
            )
            .await
    }

    /// Closes a subscription on every partition.
    ///
    /// Local delivery stops first; the close requests are then sent to each
    /// partition's leader. Every failed close is reported.
    #[instrument(
        name = "zbc_client.close_subscription",
        skip(self, handle),
        fields(topic = %handle.topic(), kind = %handle.kind())
    )]
    pub async fn close_subscription(
        &self,
        handle: SubscriptionHandle,
    ) -> std::result::Result<(), Vec<ZbcError>> {
        self.inner.close_subscription(&handle).await
    }

    /// Fetches a fresh topology and returns it.
    pub async fn topology(&self) -> Result<Arc<ClusterTopology>> {
        let router = &self.inner.router;
        self.inner.retry.retry(|_| router.refresh()).await
    }

    /// Returns the current topology without contacting a broker.
    pub fn current_topology(&self) -> Arc<ClusterTopology> {
        self.inner.router.current()
    }

    /// Asks a broker for every partition in the cluster.
    pub async fn partitions(&self) -> Result<PartitionCollection> {
        let inner = &*self.inner;
        let data = Bytes::from(MsgPackCodec::encode(&EmptyRequest {})?);
        let data = &data;

        inner
            .retry
            .retry(move |_| async move {
                let address = inner.router.any_broker();
                let connection = inner.connections.get_or_connect(&address).await?;
                let request =
                    ControlMessageRequest::new(ControlMessageType::RequestPartitions, data.clone());
                let reply = connection.request(Message::request(0, request)).await?;
                MsgPackCodec::decode(&control_reply(reply)?.data)
            })
            .await
    }

    /// Creates a task.
    pub async fn create_task(&self, topic: &str, task: Task) -> Result<Task> {
        let request = ExecuteCommandRequest::new(
            topic,
            EventType::Task,
            Bytes::from(MsgPackCodec::encode(&task)?),
        );
        let (_, task) = self.inner.execute_record(topic, request).await?;
        Ok(task)
    }

    /// Completes a task received on a task subscription.
    pub async fn complete_task(&self, event: &SubscriptionEvent) -> Result<Task> {
        let mut task = match &event.task {
            Some(task) => task.clone(),
            None => MsgPackCodec::decode(event.payload())?,
        };
        task.state = STATE_COMPLETE.to_string();

        let request = ExecuteCommandRequest::new(
            event.topic_name(),
            EventType::Task,
            Bytes::from(MsgPackCodec::encode(&task)?),
        )
        .with_key(event.key())
        .with_partition(event.partition_id());
        let (_, task) = self.inner.execute_record(event.topic_name(), request).await?;
        Ok(task)
    }

    /// Creates an instance of a deployed workflow.
    pub async fn create_workflow_instance(
        &self,
        topic: &str,
        instance: WorkflowInstance,
    ) -> Result<WorkflowInstance> {
        let request = ExecuteCommandRequest::new(
            topic,
            EventType::WorkflowInstance,
            Bytes::from(MsgPackCodec::encode(&instance)?),
        );
        let (response, mut instance): (_, WorkflowInstance) =
            self.inner.execute_record(topic, request).await?;
        if instance.workflow_instance_key.is_none() {
            instance.workflow_instance_key = Some(response.key);
        }
        Ok(instance)
    }

    /// Deploys workflow resources to `topic`.
    pub async fn deploy_workflow(&self, topic: &str, resources: Vec<Resource>) -> Result<Deployment> {
        let deployment = Deployment {
            state: STATE_CREATE.to_string(),
            topic_name: topic.to_string(),
            resources,
        };
        let request = ExecuteCommandRequest::new(
            SYSTEM_TOPIC,
            EventType::Deployment,
            Bytes::from(MsgPackCodec::encode(&deployment)?),
        )
        .with_partition(SYSTEM_PARTITION);
        let (_, deployment) = self.inner.execute_record(SYSTEM_TOPIC, request).await?;
        Ok(deployment)
    }

    /// Creates a topic with `partitions` partitions.
    pub async fn create_topic(&self, name: &str, partitions: i32) -> Result<Topic> {
        let topic = Topic {
            state: STATE_CREATE.to_string(),
            name: name.to_string(),
            partitions,
        };
        let request = ExecuteCommandRequest::new(
            SYSTEM_TOPIC,
            EventType::Topic,
            Bytes::from(MsgPackCodec::encode(&topic)?),
        )
        .with_partition(SYSTEM_PARTITION);
        let (_, topic) = self.inner.execute_record(SYSTEM_TOPIC, request).await?;
        Ok(topic)
    }

    /// Stops background refreshes and closes every connection.
    ///
    /// Pending requests fail and open subscription streams end.
    #[instrument(name = "zbc_client.shutdown", skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.connections.close_all().await;
        tracing::info!("client shut down");
    }
}

impl ClientInner {
    /// Runs one routed attempt; routing failures refresh the topology before
    /// the error is handed back to the retry policy.
    async fn attempt<T, Fut>(&self, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match op.await {
            Err(err) if err.is_routing_error() => {
                tracing::debug!(error = %err, "routed request failed, refreshing topology");
                if let Err(refresh_err) = self.router.refresh().await {
                    tracing::warn!(error = %refresh_err, "topology refresh failed");
                }
                Err(err)
            }
            other => other,
        }
    }

    async fn partition_connection(&self, partition_id: u16) -> Result<Arc<Connection>> {
        self.router.refresh_if_stale().await?;
        let address = self.router.resolve_addr(partition_id)?;
        self.connections.get_or_connect(&address).await
    }

    async fn send_command(&self, topic: &str, mut request: ExecuteCommandRequest) -> Result<Message> {
        request.topic_name = topic.to_string();
        let inner = self;
        let request = &request;

        self.retry
            .retry(move |_| async move {
                inner
                    .attempt(async {
                        let partition_id = if request.partition_id == NULL_U16 {
                            inner.router.refresh_if_stale().await?;
                            inner.router.partition_for(topic).await?
                        } else {
                            request.partition_id
                        };
                        let connection = inner.partition_connection(partition_id).await?;
                        let command = request.clone().with_partition(partition_id);
                        tracing::debug!(
                            topic,
                            partition_id,
                            event_type = ?command.event_type,
                            "sending command"
                        );
                        connection.request(Message::request(0, command)).await
                    })
                    .await
            })
            .await
    }

    /// Sends a command and decodes the record in its reply.
    async fn execute_record<T: DeserializeOwned>(
        &self,
        topic: &str,
        request: ExecuteCommandRequest,
    ) -> Result<(ExecuteCommandResponse, T)> {
        let response = command_reply(self.send_command(topic, request).await?)?;
        let state: RecordState = MsgPackCodec::decode(&response.event)?;
        if state.is_rejected() {
            return Err(ZbcError::Rejected(format!(
                "{} for key {} on {} partition {}",
                state.state, response.key, response.topic_name, response.partition_id
            )));
        }
        let record = MsgPackCodec::decode(&response.event)?;
        Ok((response, record))
    }

    async fn control_on_partition(
        &self,
        partition_id: u16,
        request: ControlMessageRequest,
    ) -> Result<ControlMessageResponse> {
        let inner = self;
        let request = &request;

        self.retry
            .retry(move |_| async move {
                inner
                    .attempt(async {
                        let connection = inner.partition_connection(partition_id).await?;
                        let message = Message::request(0, request.clone().with_partition(partition_id));
                        control_reply(connection.request(message).await?)
                    })
                    .await
            })
            .await
    }

    async fn open_subscription<F, Fut>(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        topic: &str,
        name: &str,
        capacity: usize,
        flow: FlowControl,
        open_partition: F,
    ) -> Result<(EventStream, SubscriptionHandle)>
    where
        F: Fn(Arc<Self>, u16, usize) -> Fut,
        Fut: Future<Output = Result<(PartitionSubscription, mpsc::Receiver<SubscriptionEvent>)>>,
    {
        let router = &self.router;
        let partitions = self.retry.retry(|_| router.partitions_for(topic)).await?;

        let mut opened = Vec::with_capacity(partitions.len());
        let mut receivers = Vec::with_capacity(partitions.len());
        for partition_id in partitions {
            match open_partition(Arc::clone(self), partition_id, capacity).await {
                Ok((partition, receiver)) => {
                    tracing::debug!(
                        partition_id,
                        subscriber_key = partition.subscriber_key,
                        "opened subscription on partition"
                    );
                    opened.push(partition);
                    receivers.push(receiver);
                }
                Err(err) => {
                    tracing::warn!(partition_id, error = %err, "failed to open subscription, rolling back");
                    let partial = SubscriptionHandle::new(kind, topic, name, opened);
                    if let Err(errors) = self.close_subscription(&partial).await {
                        tracing::warn!(failed = errors.len(), "rollback left partitions open");
                    }
                    return Err(err);
                }
            }
        }

        let handle = SubscriptionHandle::new(kind, topic, name, opened);
        let (merged_tx, merged_rx) = mpsc::channel(capacity.max(1));
        for (partition, receiver) in handle.partitions().iter().cloned().zip(receivers) {
            tokio::spawn(Arc::clone(self).forward(
                topic.to_string(),
                partition,
                receiver,
                merged_tx.clone(),
                handle.shutdown_receiver(),
                flow.clone(),
            ));
        }

        tracing::info!(
            partitions = handle.partitions().len(),
            "subscription opened"
        );
        Ok((EventStream::new(merged_rx), handle))
    }

    async fn open_task_partition(
        &self,
        subscription: TaskSubscription,
        capacity: usize,
    ) -> Result<(PartitionSubscription, mpsc::Receiver<SubscriptionEvent>)> {
        let partition_id = subscription.partition_id;
        let data = Bytes::from(MsgPackCodec::encode(&subscription)?);
        let inner = self;
        let data = &data;

        self.retry
            .retry(move |_| async move {
                inner
                    .attempt(async {
                        let connection = inner.partition_connection(partition_id).await?;
                        let (sender, receiver) = mpsc::channel(capacity.max(1));
                        let hook = register_on_reply(
                            &connection,
                            SubscriptionKind::Task,
                            sender,
                            task_subscriber_key,
                        );
                        let request = ControlMessageRequest::new(
                            ControlMessageType::AddTaskSubscription,
                            data.clone(),
                        )
                        .with_partition(partition_id);

                        let late = close_on_late_reply(&connection, task_close_request);
                        let reply = connection
                            .request_with_hooks(
                                Message::request(0, request),
                                Some(hook),
                                Some(late),
                            )
                            .await?;
                        let acked: TaskSubscription =
                            MsgPackCodec::decode(&control_reply(reply)?.data)?;
                        Ok((
                            PartitionSubscription {
                                partition_id,
                                subscriber_key: acked.subscriber_key,
                                address: connection.address().to_string(),
                                task: Some(acked),
                            },
                            receiver,
                        ))
                    })
                    .await
            })
            .await
    }

    async fn open_topic_partition(
        &self,
        request: ExecuteCommandRequest,
        capacity: usize,
    ) -> Result<(PartitionSubscription, mpsc::Receiver<SubscriptionEvent>)> {
        let partition_id = request.partition_id;
        let inner = self;
        let request = &request;

        self.retry
            .retry(move |_| async move {
                inner
                    .attempt(async {
                        let connection = inner.partition_connection(partition_id).await?;
                        let (sender, receiver) = mpsc::channel(capacity.max(1));
                        let hook = register_on_reply(
                            &connection,
                            SubscriptionKind::Topic,
                            sender,
                            topic_subscriber_key,
                        );

                        let late = close_on_late_reply(&connection, topic_close_request);
                        let reply = connection
                            .request_with_hooks(
                                Message::request(0, request.clone()),
                                Some(hook),
                                Some(late),
                            )
                            .await?;
                        let response = command_reply(reply)?;
                        let state: RecordState = MsgPackCodec::decode(&response.event)?;
                        if state.is_rejected() {
                            return Err(ZbcError::Rejected(format!(
                                "{} opening topic subscription on partition {}",
                                state.state, partition_id
                            )));
                        }
                        Ok((
                            PartitionSubscription {
                                partition_id,
                                subscriber_key: response.key,
                                address: connection.address().to_string(),
                                task: None,
                            },
                            receiver,
                        ))
                    })
                    .await
            })
            .await
    }

    async fn close_subscription(
        &self,
        handle: &SubscriptionHandle,
    ) -> std::result::Result<(), Vec<ZbcError>> {
        handle.deactivate();

        let mut errors = Vec::new();
        for partition in handle.partitions() {
            if let Some(connection) = self.connections.connection(&partition.address) {
                connection.dispatcher().unregister(partition.subscriber_key);
            }

            let result = match handle.kind() {
                SubscriptionKind::Task => {
                    let subscription = partition.task.clone().unwrap_or_else(|| TaskSubscription {
                        subscriber_key: partition.subscriber_key,
                        topic_name: handle.topic().to_string(),
                        partition_id: partition.partition_id,
                        task_type: handle.name().to_string(),
                        ..TaskSubscription::default()
                    });
                    self.send_control(
                        partition.partition_id,
                        ControlMessageType::RemoveTaskSubscription,
                        &subscription,
                    )
                    .await
                }
                SubscriptionKind::Topic => {
                    let close = CloseTopicSubscription {
                        topic_name: handle.topic().to_string(),
                        partition_id: partition.partition_id,
                        subscriber_key: partition.subscriber_key,
                    };
                    self.send_control(
                        partition.partition_id,
                        ControlMessageType::RemoveTopicSubscription,
                        &close,
                    )
                    .await
                }
            };

            if let Err(err) = result {
                tracing::warn!(
                    partition_id = partition.partition_id,
                    subscriber_key = partition.subscriber_key,
                    error = %err,
                    "failed to close subscription on partition"
                );
                errors.push(err);
            }
        }

        if errors.is_empty() {
            tracing::info!(partitions = handle.partitions().len(), "subscription closed");
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn send_control<T: serde::Serialize>(
        &self,
        partition_id: u16,
        message_type: ControlMessageType,
        body: &T,
    ) -> Result<ControlMessageResponse> {
        let data = Bytes::from(MsgPackCodec::encode(body)?);
        self.control_on_partition(partition_id, ControlMessageRequest::new(message_type, data))
            .await
    }

    /// Moves events of one partition into the merged stream, applying flow
    /// control as they go.
    async fn forward(
        self: Arc<Self>,
        topic: String,
        partition: PartitionSubscription,
        mut receiver: mpsc::Receiver<SubscriptionEvent>,
        merged: mpsc::Sender<SubscriptionEvent>,
        mut shutdown: watch::Receiver<bool>,
        flow: FlowControl,
    ) {
        let mut consumed: u32 = 0;
        // Acks leave through a single task per partition so their positions
        // reach the broker in order. Positions not yet sent are coalesced.
        let acks = match &flow {
            FlowControl::Acknowledge { name } => {
                let (positions_tx, positions_rx) = watch::channel(None);
                tokio::spawn(Arc::clone(&self).acknowledge_loop(
                    topic.clone(),
                    partition.partition_id,
                    partition.subscriber_key,
                    name.clone(),
                    positions_rx,
                ));
                Some(positions_tx)
            }
            FlowControl::Credits { .. } => None,
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let position = event.position();

            tokio::select! {
                _ = shutdown.changed() => break,
                sent = merged.send(event) => {
                    if sent.is_err() {
                        tracing::debug!(subscriber_key = partition.subscriber_key, "event stream dropped");
                        break;
                    }
                }
            }

            match &flow {
                FlowControl::Credits { granted } => {
                    consumed += 1;
                    if consumed >= (granted / 2).max(1) {
                        let inner = Arc::clone(&self);
                        let subscription = partition.task.clone();
                        let credits = consumed;
                        consumed = 0;
                        tokio::spawn(async move {
                            if let Some(subscription) = subscription {
                                inner.increase_credits(subscription, credits).await;
                            }
                        });
                    }
                }
                FlowControl::Acknowledge { .. } => {
                    if let Some(acks) = &acks {
                        acks.send_replace(Some(position));
                    }
                }
            }
        }

        tracing::debug!(
            partition_id = partition.partition_id,
            subscriber_key = partition.subscriber_key,
            "subscription forwarder stopped"
        );
    }

    async fn increase_credits(&self, mut subscription: TaskSubscription, credits: u32) {
        subscription.credits = credits.min(i32::MAX as u32) as i32;
        let partition_id = subscription.partition_id;
        let subscriber_key = subscription.subscriber_key;
        match self
            .send_control(
                partition_id,
                ControlMessageType::IncreaseTaskSubscriptionCredits,
                &subscription,
            )
            .await
        {
            Ok(_) => tracing::trace!(partition_id, subscriber_key, credits, "granted task credits"),
            Err(err) => tracing::warn!(
                partition_id,
                subscriber_key,
                error = %err,
                "failed to grant task credits"
            ),
        }
    }

    /// Acknowledges the latest forwarded position of one partition, one
    /// round trip at a time. Ends once the forwarder is gone and the last
    /// position was sent.
    async fn acknowledge_loop(
        self: Arc<Self>,
        topic: String,
        partition_id: u16,
        subscriber_key: u64,
        name: String,
        mut positions: watch::Receiver<Option<u64>>,
    ) {
        let mut acked: Option<u64> = None;
        while positions.changed().await.is_ok() {
            let Some(position) = *positions.borrow_and_update() else {
                continue;
            };
            if acked.is_some_and(|acked| position <= acked) {
                continue;
            }
            let ack = TopicSubscriptionAck {
                name: name.clone(),
                ack_position: position,
                state: STATE_ACKNOWLEDGE.to_string(),
            };
            self.acknowledge(&topic, partition_id, subscriber_key, ack).await;
            acked = Some(position);
        }
        tracing::trace!(partition_id, subscriber_key, ?acked, "acknowledgements stopped");
    }

    async fn acknowledge(
        &self,
        topic: &str,
        partition_id: u16,
        subscriber_key: u64,
        ack: TopicSubscriptionAck,
    ) {
        let position = ack.ack_position;
        let command = match MsgPackCodec::encode(&ack) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode acknowledgement");
                return;
            }
        };
        let request = ExecuteCommandRequest::new(topic, EventType::Subscription, Bytes::from(command))
            .with_key(subscriber_key)
            .with_partition(partition_id);

        if let Err(err) = self.send_command(topic, request).await {
            tracing::warn!(
                partition_id,
                subscriber_key,
                position,
                error = %err,
                "failed to acknowledge event"
            );
        }
    }
}

/// Builds a hook that registers `sender` under the subscriber key found in
/// the reply, before the reader task looks at the next frame.
fn register_on_reply(
    connection: &Connection,
    kind: SubscriptionKind,
    sender: mpsc::Sender<SubscriptionEvent>,
    subscriber_key: fn(&Message) -> Option<u64>,
) -> ResponseHook {
    let dispatcher = Arc::clone(connection.dispatcher());
    Box::new(move |reply: &Message| {
        if let Some(key) = subscriber_key(reply) {
            dispatcher.register_sender(key, kind, sender);
        }
    })
}

/// Builds a hook for a subscription open that timed out: if the broker
/// still accepts it, the subscription is closed again on the same connection.
fn close_on_late_reply(
    connection: &Arc<Connection>,
    close_request: fn(&Message) -> Option<ControlMessageRequest>,
) -> ResponseHook {
    let connection = Arc::downgrade(connection);
    Box::new(move |reply: &Message| {
        let Some(request) = close_request(reply) else {
            return;
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let partition_id = request.partition_id;
            match connection.request(Message::request(0, request)).await {
                Ok(_) => tracing::info!(
                    address = %connection.address(),
                    partition_id,
                    "closed subscription opened after its request timed out"
                ),
                Err(err) => tracing::warn!(
                    address = %connection.address(),
                    partition_id,
                    error = %err,
                    "failed to close subscription opened after its request timed out"
                ),
            }
        });
    })
}

fn task_close_request(reply: &Message) -> Option<ControlMessageRequest> {
    let SchemaBody::ControlMessageResponse(body) = &reply.body else {
        return None;
    };
    let subscription: TaskSubscription = MsgPackCodec::decode(&body.data).ok()?;
    Some(
        ControlMessageRequest::new(ControlMessageType::RemoveTaskSubscription, body.data.clone())
            .with_partition(subscription.partition_id),
    )
}

fn topic_close_request(reply: &Message) -> Option<ControlMessageRequest> {
    let subscriber_key = topic_subscriber_key(reply)?;
    let SchemaBody::ExecuteCommandResponse(body) = &reply.body else {
        return None;
    };
    let close = CloseTopicSubscription {
        topic_name: body.topic_name.clone(),
        partition_id: body.partition_id,
        subscriber_key,
    };
    let data = MsgPackCodec::encode(&close).ok()?;
    Some(
        ControlMessageRequest::new(ControlMessageType::RemoveTopicSubscription, Bytes::from(data))
            .with_partition(body.partition_id),
    )
}

fn task_subscriber_key(reply: &Message) -> Option<u64> {
    match &reply.body {
        SchemaBody::ControlMessageResponse(body) => MsgPackCodec::decode::<TaskSubscription>(&body.data)
            .ok()
            .map(|subscription| subscription.subscriber_key),
        _ => None,
    }
}

fn topic_subscriber_key(reply: &Message) -> Option<u64> {
    match &reply.body {
        SchemaBody::ExecuteCommandResponse(body) => {
            let state: RecordState = MsgPackCodec::decode(&body.event).ok()?;
            (!state.is_rejected()).then_some(body.key)
        }
        _ => None,
    }
}

fn command_reply(message: Message) -> Result<ExecuteCommandResponse> {
    match message.body {
        SchemaBody::ExecuteCommandResponse(response) => Ok(response),
        other => Err(ZbcError::UnexpectedResponse(format!(
            "expected command response, got template {}",
            other.message_header().template_id
        ))),
    }
}

fn control_reply(message: Message) -> Result<ControlMessageResponse> {
    match message.body {
        SchemaBody::ControlMessageResponse(response) => Ok(response),
        other => Err(ZbcError::UnexpectedResponse(format!(
            "expected control message response, got template {}",
            other.message_header().template_id
        ))),
    }
}
