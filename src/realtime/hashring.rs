//! Consistent hashing of partitions onto nodes

use siphasher::sip::SipHasher13;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Virtual nodes per unit of weight
pub const VIRTUAL_NODES: usize = 160;

/// Ring with equal-weight virtual nodes.
///
/// Hashing is keyed with constants so every process builds the same ring from
/// the same roster.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

fn hash(key: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(key.as_bytes());
    hasher.finish()
}

impl HashRing {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = BTreeMap::new();
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..VIRTUAL_NODES {
                ring.insert(hash(&format!("{}-{}", node, replica)), node.to_string());
            }
        }
        Self { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Owner of `key`: the first virtual node clockwise from its hash
    pub fn get_node(&self, key: &str) -> Option<&str> {
        let point = hash(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }
}
