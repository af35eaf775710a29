//! Async Rust client for Zeebe-style workflow brokers.
//!
//! This crate talks to a cluster of brokers over their binary client
//! protocol. It is built on [Tokio](https://tokio.rs/) and exposes every
//! operation as an `async fn`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use zbc_client::{ClientConfig, Task, ZbcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .bootstrap_address("127.0.0.1:51015")
//!         .build()?;
//!     let client = ZbcClient::connect(config).await?;
//!
//!     client.create_task("default-topic", Task::new("payment")).await?;
//!
//!     let (mut tasks, handle) = client
//!         .open_task_subscription("default-topic", "worker-1", "payment", 32)
//!         .await?;
//!     if let Some(event) = tasks.recv().await {
//!         client.complete_task(&event).await?;
//!     }
//!
//!     if let Err(errors) = client.close_subscription(handle).await {
//!         eprintln!("{} partitions failed to close", errors.len());
//!     }
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Routing
//!
//! Every command goes to the leader of one partition of its topic. The
//! [`ClusterTopology`] is fetched from a broker at connect time, refreshed
//! when it is older than the configured interval and refreshed again whenever
//! a routed request fails for a routing reason. Retryable failures are
//! retried with exponential backoff until the retry deadline; see
//! [`RetryPolicy`].
//!
//! # Subscriptions
//!
//! | Kind | Opened with | Flow control |
//! |------|-------------|--------------|
//! | Task | [`ZbcClient::open_task_subscription`] | credits, granted back as tasks are consumed |
//! | Topic | [`ZbcClient::open_topic_subscription`] | per-event acknowledgement |
//!
//! Both return an [`EventStream`] merging every partition and a
//! [`SubscriptionHandle`] to pass to [`ZbcClient::close_subscription`].
//!
//! # Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use zbc_client::ClientConfig;
//!
//! let config = ClientConfig::builder()
//!     .bootstrap_address("10.0.0.1:51015")
//!     .network(|n| n.connection_timeout(Duration::from_secs(2)))
//!     .retry(|r| r
//!         .initial_backoff(Duration::from_millis(5))
//!         .max_backoff(Duration::from_millis(200))
//!         .deadline(Duration::from_secs(30)))
//!     .topology(|t| t.refresh_interval(Duration::from_secs(10)))
//!     .build()
//!     .unwrap();
//! # let _ = config;
//! ```

#![warn(missing_docs)]

mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod payload;
pub mod retry;
pub mod subscription;
pub mod transaction;

pub use client::{ZbcClient, SYSTEM_PARTITION, SYSTEM_TOPIC};
pub use cluster::{ClusterTopology, Router, TopologyFetcher};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, NetworkConfig, NetworkConfigBuilder,
    RetryConfig, RetryConfigBuilder, SubscriptionConfig, SubscriptionConfigBuilder,
    TopologyConfig, TopologyConfigBuilder,
};
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionManager};
pub use payload::{
    Deployment, MsgPackCodec, PartitionCollection, Resource, Task, TaskSubscription, Topic,
    TopologyResponse, WorkflowInstance,
};
pub use retry::{with_retry, Backoff, RetryPolicy};
pub use subscription::{
    DispatchOutcome, EventStream, PartitionSubscription, SubscriptionDispatcher,
    SubscriptionEvent, SubscriptionHandle, SubscriptionKind,
};
pub use transaction::{PendingTransaction, TransactionRegistry, TransactionState};

pub use zbc_core::protocol::{ExecuteCommandRequest, Message};
pub use zbc_core::{DecodeError, Result, ZbcError};
