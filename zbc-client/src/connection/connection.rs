//! Single multiplexed connection to a broker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use zbc_core::protocol::{Message, MessageCodec, MessageReader, MessageWriter, SchemaBody};
use zbc_core::{Result, ZbcError};

use crate::config::NetworkConfig;
use crate::subscription::{DispatchOutcome, SubscriptionDispatcher};
use crate::transaction::{ResponseHook, TransactionRegistry};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection to one broker, shared by every request routed there.
///
/// Writes are serialized behind a lock. A background reader task completes
/// transactions and dispatches pushed subscription events. When the socket
/// fails, every pending transaction fails with
/// [`ZbcError::ConnectionClosed`] and every subscription channel on the
/// connection ends.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    message_writer: MessageWriter,
    transactions: Arc<TransactionRegistry>,
    dispatcher: Arc<SubscriptionDispatcher>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    request_timeout: Duration,
    created_at: Instant,
}

impl Connection {
    /// Dials `address` and starts the reader task.
    pub async fn connect(address: &str, config: &NetworkConfig) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connection_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| {
                ZbcError::Connection(format!(
                    "timed out connecting to {} after {:?}",
                    address,
                    config.connection_timeout()
                ))
            })?
            .map_err(|e| ZbcError::Connection(format!("failed to connect to {}: {}", address, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ZbcError::Connection(format!("failed to set TCP_NODELAY: {}", e)))?;

        let connection = Self::from_stream(stream, address, config);
        tracing::debug!(id = %connection.id, address = %address, "established connection");
        Ok(connection)
    }

    /// Wraps an established stream and starts the reader task.
    pub fn from_stream(stream: TcpStream, address: &str, config: &NetworkConfig) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            address: address.to_string(),
            writer: Mutex::new(write_half),
            message_writer: MessageWriter::new(),
            transactions: Arc::new(TransactionRegistry::new()),
            dispatcher: Arc::new(SubscriptionDispatcher::new()),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            request_timeout: config.request_timeout(),
            created_at: Instant::now(),
        });

        let reader = MessageReader::with_codec(
            read_half,
            MessageCodec::with_max_frame_length(config.max_frame_length()),
        );
        let loop_state = ReadLoop {
            id: connection.id,
            address: connection.address.clone(),
            transactions: Arc::clone(&connection.transactions),
            dispatcher: Arc::clone(&connection.dispatcher),
            closed: Arc::clone(&connection.closed),
            poll_interval: config.read_poll_interval(),
        };
        tokio::spawn(loop_state.run(reader, shutdown_rx));

        connection
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the broker address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns true once the connection failed or was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.transactions.len()
    }

    /// Returns the subscription dispatcher of this connection.
    pub fn dispatcher(&self) -> &Arc<SubscriptionDispatcher> {
        &self.dispatcher
    }

    /// Sends a request and waits for its response.
    ///
    /// The transaction id in `message` is replaced.
    pub async fn request(&self, message: Message) -> Result<Message> {
        self.request_with_hooks(message, None, None).await
    }

    /// Sends a request with hooks that run on the reader task.
    ///
    /// `on_reply` runs before the caller wakes. `on_late` is kept if the
    /// request times out and runs if the response arrives afterwards.
    pub async fn request_with_hooks(
        &self,
        mut message: Message,
        on_reply: Option<ResponseHook>,
        on_late: Option<ResponseHook>,
    ) -> Result<Message> {
        let pending = self.transactions.begin_with_hook(on_reply)?;
        message.set_request_id(pending.id());
        tracing::trace!(id = %self.id, request_id = pending.id(), "sending request");

        self.send(&message).await?;
        pending.wait_or_leave(self.request_timeout, on_late).await
    }

    /// Writes one message.
    ///
    /// A failed or short write closes the connection.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ZbcError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.address
            )));
        }

        let bytes = self.message_writer.write_message(message)?;
        let mut writer = self.writer.lock().await;
        let mut written = 0;
        while written < bytes.len() {
            match writer.write(&bytes[written..]).await {
                Ok(0) => {
                    let err = ZbcError::SocketWrite {
                        expected: bytes.len(),
                        written,
                    };
                    self.teardown(&err.to_string());
                    let _ = writer.shutdown().await;
                    return Err(err);
                }
                Ok(n) => written += n,
                Err(e) => {
                    let err = ZbcError::Connection(format!(
                        "failed to write to {}: {}",
                        self.address, e
                    ));
                    self.teardown(&err.to_string());
                    let _ = writer.shutdown().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Closes the connection, failing pending requests.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown("connection closed by client");
        let _ = self.writer.lock().await.shutdown().await;
        tracing::debug!(id = %self.id, address = %self.address, "connection closed");
    }

    fn teardown(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.transactions.fail_all(reason);
        self.dispatcher.clear();
    }
}

struct ReadLoop {
    id: ConnectionId,
    address: String,
    transactions: Arc<TransactionRegistry>,
    dispatcher: Arc<SubscriptionDispatcher>,
    closed: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ReadLoop {
    async fn run(self, mut reader: MessageReader<OwnedReadHalf>, mut shutdown: watch::Receiver<bool>) {
        let reason = loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break "connection closed by client".to_string(),
                result = reader.read_message(self.poll_interval) => result,
            };

            let message = match result {
                Ok(message) => message,
                Err(ZbcError::Timeout(_)) => continue,
                Err(ZbcError::Decode(err)) => {
                    tracing::warn!(id = %self.id, address = %self.address, error = %err, "discarding malformed frame");
                    continue;
                }
                Err(err) => break err.to_string(),
            };

            if let Some(request_id) = message.request_id() {
                self.transactions.complete(request_id, message);
                continue;
            }

            match message.body {
                SchemaBody::SubscribedEvent(event) => {
                    // A full consumer channel stalls reading; shutdown still wins.
                    tokio::select! {
                        _ = shutdown.changed() => break "connection closed by client".to_string(),
                        outcome = self.dispatcher.dispatch(event) => {
                            if outcome == DispatchOutcome::UnknownSubscriber {
                                tracing::debug!(id = %self.id, "event for unknown subscriber dropped");
                            }
                        }
                    }
                }
                other => {
                    tracing::warn!(
                        id = %self.id,
                        template_id = other.message_header().template_id,
                        "dropping uncorrelated message"
                    );
                }
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        let failed = self.transactions.fail_all(&reason);
        self.dispatcher.clear();
        tracing::info!(
            id = %self.id,
            address = %self.address,
            failed_requests = failed,
            reason = %reason,
            "connection reader stopped"
        );
    }
}
