use std::collections::BTreeMap;
use std::fmt::Display;

use crc::{Crc, CRC_64_REDIS};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

const HASHER: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

pub const DEFAULT_REPLICAS: usize = 160;

fn hash_key(key: &str) -> u64 {
    HASHER.checksum(key.as_bytes())
}

/// A consistent-hash ring: each node occupies `replicas` virtual points on a
///  u64 circle, a key routes to the first point at or after its own hash,
///  wrapping around at the top. Adding or removing one node only remaps the
///  keys adjacent to its points.
#[derive(Debug, Clone)]
pub struct HashRing<T: Clone + Display> {
    replicas: usize,
    ring: BTreeMap<u64, T>,
}

impl<T: Clone + Display> HashRing<T> {
    pub fn new(replicas: usize) -> HashRing<T> {
        HashRing {
            replicas,
            ring: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, node: T) {
        for i in 0..self.replicas {
            self.ring.insert(hash_key(&format!("{}{}", node, i)), node.clone());
        }
        debug!(node = %node, "added node to the ring");
    }

    /// Removal is keyed by display representation, so an equal-printing node
    ///  removes the original's points.
    pub fn remove(&mut self, node: &T) {
        for i in 0..self.replicas {
            self.ring.remove(&hash_key(&format!("{}{}", node, i)));
        }
        debug!(node = %node, "removed node from the ring");
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The node responsible for this key, `None` on an empty ring.
    pub fn route(&self, key: &str) -> Option<&T> {
        let h = hash_key(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
    }

    /// Routes a random key, spreading keyless requests across the ring.
    pub fn route_any(&self) -> Option<&T> {
        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        self.route(&key)
    }

    /// All distinct nodes by display representation.
    pub fn nodes(&self) -> Vec<&T> {
        let mut seen = std::collections::HashSet::new();
        self.ring
            .values()
            .filter(|node| seen.insert(node.to_string()))
            .collect()
    }
}
