//! Pool of broker connections keyed by address.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::instrument;

use zbc_core::protocol::{ControlMessageRequest, ControlMessageType, Message, SchemaBody};
use zbc_core::{Result, ZbcError};

use super::{Connection, ConnectionId};
use crate::cluster::TopologyFetcher;
use crate::config::NetworkConfig;
use crate::payload::{EmptyRequest, MsgPackCodec, TopologyResponse};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connected to a broker.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// The broker address.
        address: String,
    },
    /// A connection was closed or replaced.
    Disconnected {
        /// The connection identifier.
        id: ConnectionId,
        /// The broker address.
        address: String,
    },
}

/// Opens at most one live connection per broker address and shares it.
///
/// A connection found closed is replaced on the next lookup.
#[derive(Debug)]
pub struct ConnectionManager {
    config: NetworkConfig,
    connections: DashMap<String, Arc<Connection>>,
    dial_lock: Mutex<()>,
    event_sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Creates an empty pool.
    pub fn new(config: NetworkConfig) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            connections: DashMap::new(),
            dial_lock: Mutex::new(()),
            event_sender,
        }
    }

    /// Returns the network configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns the live connection to `address`, if one exists.
    pub fn connection(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|connection| !connection.is_closed())
    }

    /// Returns the live connection to `address`, dialing if necessary.
    #[instrument(
        name = "connection_manager.connect",
        skip(self),
        fields(address = %address)
    )]
    pub async fn get_or_connect(&self, address: &str) -> Result<Arc<Connection>> {
        if let Some(connection) = self.connection(address) {
            return Ok(connection);
        }

        let _guard = self.dial_lock.lock().await;
        if let Some(connection) = self.connection(address) {
            return Ok(connection);
        }

        if let Some((_, stale)) = self.connections.remove(address) {
            tracing::debug!(id = %stale.id(), "replacing closed connection");
            let _ = self.event_sender.send(ConnectionEvent::Disconnected {
                id: stale.id(),
                address: address.to_string(),
            });
        }

        tracing::debug!(timeout = ?self.config.connection_timeout(), "attempting connection");
        let connection = Connection::connect(address, &self.config).await?;
        let id = connection.id();
        self.connections
            .insert(address.to_string(), Arc::clone(&connection));

        let _ = self.event_sender.send(ConnectionEvent::Connected {
            id,
            address: address.to_string(),
        });
        tracing::info!(id = %id, "connected to broker");
        Ok(connection)
    }

    /// Closes and forgets the connection to `address`.
    pub async fn disconnect(&self, address: &str) -> bool {
        match self.connections.remove(address) {
            Some((_, connection)) => {
                connection.close().await;
                let _ = self.event_sender.send(ConnectionEvent::Disconnected {
                    id: connection.id(),
                    address: address.to_string(),
                });
                tracing::info!(id = %connection.id(), address = %address, "disconnected from broker");
                true
            }
            None => false,
        }
    }

    /// Closes every connection.
    #[instrument(name = "connection_manager.shutdown", skip(self))]
    pub async fn close_all(&self) {
        let addresses: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tracing::debug!(connection_count = addresses.len(), "disconnecting all connections");

        for address in addresses {
            self.disconnect(&address).await;
        }
    }

    /// Returns the number of pooled connections, live or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns the addresses of live connections.
    pub fn connected_addresses(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl TopologyFetcher for ConnectionManager {
    async fn fetch_topology(&self, address: &str) -> Result<TopologyResponse> {
        let connection = self.get_or_connect(address).await?;
        let request = ControlMessageRequest::new(
            ControlMessageType::RequestTopology,
            Bytes::from(MsgPackCodec::encode(&EmptyRequest {})?),
        );

        let response = connection.request(Message::request(0, request)).await?;
        match response.body {
            SchemaBody::ControlMessageResponse(body) => MsgPackCodec::decode(&body.data),
            other => Err(ZbcError::UnexpectedResponse(format!(
                "topology request answered with template {}",
                other.message_header().template_id
            ))),
        }
    }
}
