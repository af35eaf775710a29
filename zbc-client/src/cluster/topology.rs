//! Immutable snapshot of partition leadership.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::payload::{Broker, TopologyResponse};

/// Which broker leads which partition, and which partitions make up each topic.
///
/// Only partitions a broker reports as `LEADER` are indexed. A snapshot is
/// never mutated; refreshes replace it whole.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    brokers: Vec<Broker>,
    partition_leaders: HashMap<u16, String>,
    partitions_by_topic: HashMap<String, Vec<u16>>,
    updated_at: Option<Instant>,
}

impl ClusterTopology {
    /// Creates an empty snapshot. It is always stale.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot from a topology reply.
    pub fn from_response(response: TopologyResponse) -> Self {
        let mut partition_leaders = HashMap::new();
        let mut partitions_by_topic: HashMap<String, Vec<u16>> = HashMap::new();

        for broker in &response.brokers {
            let address = broker.addr();
            for partition in broker.partitions.iter().filter(|p| p.is_leader()) {
                if let Some(previous) =
                    partition_leaders.insert(partition.partition_id, address.clone())
                {
                    if previous != address {
                        tracing::warn!(
                            partition_id = partition.partition_id,
                            previous = %previous,
                            leader = %address,
                            "two brokers claim leadership of one partition"
                        );
                    }
                }
                let partitions = partitions_by_topic
                    .entry(partition.topic_name.clone())
                    .or_default();
                if !partitions.contains(&partition.partition_id) {
                    partitions.push(partition.partition_id);
                }
            }
        }
        for partitions in partitions_by_topic.values_mut() {
            partitions.sort_unstable();
        }

        Self {
            brokers: response.brokers,
            partition_leaders,
            partitions_by_topic,
            updated_at: Some(Instant::now()),
        }
    }

    /// Returns the brokers of the reply this snapshot was built from.
    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    /// Returns the address of the partition's leader.
    pub fn leader_addr(&self, partition_id: u16) -> Option<&str> {
        self.partition_leaders.get(&partition_id).map(String::as_str)
    }

    /// Returns the sorted partition ids of a topic.
    pub fn partitions(&self, topic: &str) -> Option<&[u16]> {
        self.partitions_by_topic
            .get(topic)
            .map(Vec::as_slice)
            .filter(|partitions| !partitions.is_empty())
    }

    /// Returns the names of all known topics.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.partitions_by_topic.keys().map(String::as_str)
    }

    /// Returns the number of partitions with a known leader.
    pub fn partition_count(&self) -> usize {
        self.partition_leaders.len()
    }

    /// Returns true if no broker is known.
    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    /// Returns a random broker address, if any broker is known.
    pub fn random_broker(&self) -> Option<String> {
        self.brokers
            .choose(&mut rand::thread_rng())
            .map(Broker::addr)
    }

    /// Returns how long ago the snapshot was taken.
    pub fn age(&self) -> Option<Duration> {
        self.updated_at.map(|at| at.elapsed())
    }

    /// Returns true if the snapshot is older than `max_age` or was never filled.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.age() {
            Some(age) => age >= max_age,
            None => true,
        }
    }
}

impl fmt::Display for ClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterTopology[brokers={}, partitions={}, topics={}]",
            self.brokers.len(),
            self.partition_leaders.len(),
            self.partitions_by_topic.len()
        )
    }
}
