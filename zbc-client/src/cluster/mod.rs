//! Cluster topology and request routing.

mod router;
mod topology;

pub use router::{Router, TopologyFetcher};
pub use topology::ClusterTopology;
