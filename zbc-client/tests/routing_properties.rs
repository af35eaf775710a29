// Property tests for backoff bounds and topology construction.

use std::time::Duration;

use proptest::prelude::*;

use zbc_client::payload::{Broker, BrokerPartition};
use zbc_client::{Backoff, ClusterTopology, TopologyResponse};

fn partition_strategy() -> impl Strategy<Value = BrokerPartition> {
    (prop_oneof!["orders", "invoices"], 0u16..16, any::<bool>()).prop_map(
        |(topic, partition_id, leader)| BrokerPartition {
            state: if leader { "LEADER" } else { "FOLLOWER" }.to_string(),
            topic_name: topic.to_string(),
            partition_id,
        },
    )
}

fn topology_strategy() -> impl Strategy<Value = TopologyResponse> {
    proptest::collection::vec(proptest::collection::vec(partition_strategy(), 0..8), 1..4).prop_map(
        |brokers| TopologyResponse {
            brokers: brokers
                .into_iter()
                .enumerate()
                .map(|(i, partitions)| Broker {
                    host: "10.0.0.1".to_string(),
                    port: 51015 + i as u64,
                    partitions,
                })
                .collect(),
        },
    )
}

proptest! {
    #[test]
    fn backoff_stays_within_bounds(
        min_ms in 1u64..100,
        extra_ms in 0u64..5_000,
        factor in 1.0f64..4.0,
        jitter in any::<bool>(),
        attempt in 0u32..200,
    ) {
        let min = Duration::from_millis(min_ms);
        let max = Duration::from_millis(min_ms + extra_ms);
        let backoff = Backoff::new(min, max, factor, jitter);

        let delay = backoff.for_attempt(attempt);
        // Float round trips may lose a nanosecond at either end.
        prop_assert!(delay + Duration::from_nanos(1) >= min);
        prop_assert!(delay <= max + Duration::from_nanos(1));
    }

    #[test]
    fn backoff_without_jitter_never_shrinks(
        min_ms in 1u64..100,
        factor in 1.0f64..4.0,
        attempt in 0u32..64,
    ) {
        let backoff = Backoff::new(
            Duration::from_millis(min_ms),
            Duration::from_secs(10),
            factor,
            false,
        );
        prop_assert!(backoff.for_attempt(attempt) <= backoff.for_attempt(attempt + 1));
    }

    #[test]
    fn topology_lists_only_leader_partitions(response in topology_strategy()) {
        let topology = ClusterTopology::from_response(response.clone());

        for topic in ["orders", "invoices"] {
            let led: Vec<u16> = response
                .brokers
                .iter()
                .flat_map(|b| b.partitions.iter())
                .filter(|p| p.is_leader() && p.topic_name == topic)
                .map(|p| p.partition_id)
                .collect();

            match topology.partitions(topic) {
                None => prop_assert!(led.is_empty()),
                Some(partitions) => {
                    prop_assert!(partitions.windows(2).all(|w| w[0] < w[1]));
                    for partition_id in partitions {
                        prop_assert!(led.contains(partition_id));
                        prop_assert!(topology.leader_addr(*partition_id).is_some());
                    }
                }
            }
        }
    }
}
