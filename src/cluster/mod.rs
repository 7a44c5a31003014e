pub mod cluster_client;
pub mod ring;

pub use cluster_client::{ClusterClient, ClusterUnit};
pub use ring::HashRing;
