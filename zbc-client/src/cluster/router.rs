//! Topology-aware routing of requests to partition leaders.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use zbc_core::{Result, ZbcError};

use super::ClusterTopology;
use crate::payload::TopologyResponse;

/// Source of topology replies.
#[async_trait]
pub trait TopologyFetcher: Send + Sync + std::fmt::Debug {
    /// Asks the broker at `address` for the cluster topology.
    async fn fetch_topology(&self, address: &str) -> Result<TopologyResponse>;
}

/// Picks partitions for topics and resolves their leaders.
///
/// Readers load the current [`ClusterTopology`] without locking. Refreshes are
/// single-flight: callers that arrive while a refresh is running wait for it
/// and reuse its result.
#[derive(Debug)]
pub struct Router {
    topology: ArcSwap<ClusterTopology>,
    cursors: DashMap<String, usize>,
    fetcher: Arc<dyn TopologyFetcher>,
    bootstrap_address: String,
    refresh_interval: Duration,
    refresh_lock: Mutex<()>,
}

impl Router {
    /// Creates a router with an empty topology.
    pub fn new(
        fetcher: Arc<dyn TopologyFetcher>,
        bootstrap_address: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            topology: ArcSwap::from_pointee(ClusterTopology::empty()),
            cursors: DashMap::new(),
            fetcher,
            bootstrap_address: bootstrap_address.into(),
            refresh_interval,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> Arc<ClusterTopology> {
        self.topology.load_full()
    }

    /// Returns the bootstrap address.
    pub fn bootstrap_address(&self) -> &str {
        &self.bootstrap_address
    }

    /// Returns a known broker address, falling back to the bootstrap address.
    pub fn any_broker(&self) -> String {
        self.topology
            .load()
            .random_broker()
            .unwrap_or_else(|| self.bootstrap_address.clone())
    }

    /// Picks the next partition of `topic` in round-robin order.
    ///
    /// An unknown topic triggers one refresh before failing with
    /// [`ZbcError::TopicLeaderNotFound`].
    pub async fn partition_for(&self, topic: &str) -> Result<u16> {
        if let Some(partition_id) = self.next_partition(topic) {
            return Ok(partition_id);
        }
        self.refresh().await?;
        self.next_partition(topic)
            .ok_or_else(|| ZbcError::TopicLeaderNotFound(topic.to_string()))
    }

    /// Returns every partition of `topic` with a known leader.
    ///
    /// Refreshes once if the topic is unknown.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<u16>> {
        if let Some(partitions) = self.current().partitions(topic) {
            return Ok(partitions.to_vec());
        }
        self.refresh().await?;
        self.current()
            .partitions(topic)
            .map(<[u16]>::to_vec)
            .ok_or_else(|| ZbcError::TopicLeaderNotFound(topic.to_string()))
    }

    /// Returns the leader address of a partition.
    pub fn resolve_addr(&self, partition_id: u16) -> Result<String> {
        self.topology
            .load()
            .leader_addr(partition_id)
            .map(str::to_string)
            .ok_or(ZbcError::PartitionNotFound(partition_id))
    }

    fn next_partition(&self, topic: &str) -> Option<u16> {
        let topology = self.topology.load();
        let partitions = topology.partitions(topic)?;
        let mut cursor = self.cursors.entry(topic.to_string()).or_insert(0);
        let partition_id = partitions[*cursor % partitions.len()];
        *cursor = cursor.wrapping_add(1);
        Some(partition_id)
    }

    /// Fetches a new topology from a known broker and swaps it in.
    ///
    /// A failed fetch from a known broker falls back to the bootstrap address.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<ClusterTopology>> {
        let seen = self.topology.load_full();
        let _guard = self.refresh_lock.lock().await;

        let current = self.topology.load_full();
        if !Arc::ptr_eq(&seen, &current) {
            tracing::debug!("topology refreshed while waiting");
            return Ok(current);
        }

        let address = current
            .random_broker()
            .unwrap_or_else(|| self.bootstrap_address.clone());
        let response = match self.fetcher.fetch_topology(&address).await {
            Ok(response) => response,
            Err(err) if address != self.bootstrap_address => {
                tracing::warn!(
                    address = %address,
                    error = %err,
                    "topology request failed, retrying against bootstrap address"
                );
                self.fetcher.fetch_topology(&self.bootstrap_address).await?
            }
            Err(err) => return Err(err),
        };

        let topology = Arc::new(ClusterTopology::from_response(response));
        if topology.is_empty() {
            return Err(ZbcError::NoBrokersFound);
        }
        tracing::info!(
            brokers = topology.brokers().len(),
            partitions = topology.partition_count(),
            "topology refreshed"
        );
        self.topology.store(Arc::clone(&topology));
        Ok(topology)
    }

    /// Refreshes if the snapshot is older than the refresh interval.
    ///
    /// A failed refresh keeps the old snapshot unless there is none.
    pub async fn refresh_if_stale(&self) -> Result<Arc<ClusterTopology>> {
        let current = self.current();
        if !current.is_stale(self.refresh_interval) {
            return Ok(current);
        }
        match self.refresh().await {
            Ok(topology) => Ok(topology),
            Err(err) if !current.is_empty() => {
                tracing::warn!(error = %err, "topology refresh failed, keeping previous snapshot");
                Ok(current)
            }
            Err(err) => Err(err),
        }
    }

    /// Spawns a task that refreshes stale topology every refresh interval.
    ///
    /// The task ends on shutdown or once the router is dropped.
    pub fn spawn_refresh_task(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let router: Weak<Router> = Arc::downgrade(self);
        let period = self.refresh_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(router) = router.upgrade() else { break };
                        if let Err(err) = router.refresh_if_stale().await {
                            tracing::warn!(error = %err, "periodic topology refresh failed");
                        }
                    }
                }
            }
            tracing::debug!("topology refresh task stopped");
        })
    }
}
