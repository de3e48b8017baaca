//! Provides a consistent-hash ring which assigns cache keys to peer nodes.
//!
//! Distributing keys by `hash(key) % nodes` reshuffles almost the entire key space whenever the
//! cluster changes. A consistent-hash ring instead places nodes on a circle of hash values and
//! assigns each key to the first node at or after its own hash, therefore only a small fraction
//! of keys moves when a node joins.
//!
//! A single position per real node yields an uneven load distribution over an unpredictable key
//! space. Each real node is therefore replicated into a number of **virtual nodes** which
//! approximate uniform coverage of the ring.
use std::collections::HashMap;

/// Computes the ring position for a sequence of bytes.
///
/// The hash function is pluggable for testability and to avoid adversarial collisions. The
/// default is a CRC-32 (IEEE) checksum over the input.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Maps cache keys to real node identifiers via virtual-node replication.
///
/// The ring keeps an ascending sorted sequence of virtual-node hashes plus a mapping from each
/// virtual hash back to its owning real node. Lookups are a binary search (O(log V) for V
/// virtual nodes); adding nodes re-sorts the whole sequence, which is acceptable as topology
/// changes are rare compared to lookups.
///
/// # Examples
/// ```
/// # use ganymede::ring::HashRing;
/// let mut ring = HashRing::new(64);
/// ring.add(["cache-1:9190", "cache-2:9190", "cache-3:9190"]);
///
/// // Every key is deterministically owned by one of the nodes...
/// let owner = ring.get("some-key").unwrap().to_owned();
/// assert!(owner.ends_with(":9190"));
///
/// // ...and repeated lookups always yield the same owner.
/// assert_eq!(ring.get("some-key"), Some(owner.as_str()));
/// ```
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    keys: Vec<u32>,
    nodes: HashMap<u32, String>,
}

impl HashRing {
    /// Creates a new ring which replicates each real node into the given number of virtual
    /// nodes, hashed with CRC-32 (IEEE).
    pub fn new(replicas: usize) -> Self {
        Self::with_hash(replicas, Box::new(crc32fast::hash))
    }

    /// Creates a new ring with a custom hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            replicas,
            hash,
            keys: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Adds the given real nodes to the ring.
    ///
    /// Each node is expanded into `replicas` virtual nodes by hashing the virtual-node index
    /// concatenated with the node identifier. The hash sequence is re-sorted afterwards so
    /// that [get](HashRing::get) stays a binary search.
    pub fn add<I, S>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for node in nodes {
            let node = node.as_ref();
            for index in 0..self.replicas {
                let hash = (self.hash)(format!("{}{}", index, node).as_bytes());
                self.keys.push(hash);
                let _ = self.nodes.insert(hash, node.to_owned());
            }
        }

        self.keys.sort_unstable();
    }

    /// Returns the real node owning the given key or **None** if the ring is empty.
    ///
    /// An empty ring is a legitimate (empty cluster) state, not an error. Otherwise the first
    /// virtual node with a hash at or after the key's hash owns the key, wrapping around to
    /// the ring minimum if the key hashes beyond the largest ring position.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.keys.partition_point(|&ring_hash| ring_hash < hash);
        let ring_hash = self.keys[index % self.keys.len()];

        self.nodes.get(&ring_hash).map(|node| node.as_str())
    }

    /// Returns the total number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Determines if no nodes have been added yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::HashRing;

    /// Provides a hash which simply parses its input as a number, so that the ring layout
    /// is fully predictable.
    fn numeric_ring() -> HashRing {
        HashRing::with_hash(
            3,
            Box::new(|data| {
                std::str::from_utf8(data)
                    .expect("non UTF-8 ring key")
                    .parse()
                    .expect("non numeric ring key")
            }),
        )
    }

    #[test]
    fn keys_are_assigned_to_the_next_virtual_node() {
        let mut ring = numeric_ring();

        // With 3 replicas, the nodes below occupy the virtual positions
        // 2, 4, 6, 12, 14, 16, 22, 24 and 26.
        ring.add(["6", "4", "2"]);
        assert_eq!(ring.len(), 9);

        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));

        // 27 lies beyond the largest ring position and therefore wraps around
        // to the ring minimum...
        assert_eq!(ring.get("27"), Some("2"));
    }

    #[test]
    fn joining_nodes_only_take_over_their_own_range() {
        let mut ring = numeric_ring();
        ring.add(["6", "4", "2"]);

        // Adding "8" introduces the virtual positions 8, 18 and 28...
        ring.add(["8"]);

        // ...so that 27 is now owned by the new node while the other
        // assignments stay put.
        assert_eq!(ring.get("27"), Some("8"));
        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));
    }

    #[test]
    fn an_empty_ring_yields_no_owner() {
        let ring = HashRing::new(16);
        assert_eq!(ring.get("anything"), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn the_default_hash_spreads_keys_over_all_nodes() {
        let mut ring = HashRing::new(64);
        ring.add(["a", "b", "c"]);

        let mut seen = std::collections::HashSet::new();
        for index in 0..256 {
            let _ = seen.insert(ring.get(&format!("key-{}", index)).unwrap().to_owned());
        }

        // 256 keys over 3 nodes with 64 replicas each - every node should own some share.
        assert_eq!(seen.len(), 3);
    }
}
