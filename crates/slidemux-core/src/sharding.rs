//! Shard placement for image keys.
//!
//! Placement is a pure function of the key and the configured topology: the
//! same key always resolves to the same [`TileServerShard`] until the
//! topology changes. The manager consumes placement through the
//! [`ShardingAlgorithm`] trait so deployments can swap in an external
//! placement service; [`ConsistentHashSharding`] is the built-in provider.
//!
//! The built-in provider puts each shard on a 64-bit hash ring at
//! `virtual_nodes` positions (FNV-1a, golden-ratio mixing per virtual index)
//! and owns a key with the first shard at or after the key's hash, wrapping
//! around the ring. Adding or removing a shard only remaps ~1/N of keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::session::{ShardId, TileServerShard};

/// Maps an image key to the tile-server shard that should own it.
pub trait ShardingAlgorithm: Send + Sync {
    /// Resolve the owning shard for `key`.
    ///
    /// Pure and deterministic for a given topology. `None` when no shard is
    /// configured.
    fn shard_for(&self, key: &str) -> Option<TileServerShard>;
}

/// Shared handle to a sharding algorithm.
pub type ShardingHandle = Arc<dyn ShardingAlgorithm>;

/// Consistent-hash shard placement over a fixed topology.
#[derive(Debug, Clone)]
pub struct ConsistentHashSharding {
    /// Ring position → owning shard.
    ring: BTreeMap<u64, ShardId>,
    /// Shard id → full descriptor.
    shards: HashMap<ShardId, TileServerShard>,
}

impl ConsistentHashSharding {
    /// Build a ring from the configured topology.
    ///
    /// An empty topology is allowed (every key resolves to `None`); duplicate
    /// shard ids or labels, and a zero virtual-node count, are configuration
    /// errors.
    pub fn new(
        topology: Vec<TileServerShard>,
        virtual_nodes: u32,
    ) -> Result<Self, ConfigError> {
        if virtual_nodes == 0 {
            return Err(ConfigError::Invalid(
                "sharding.virtual_nodes must be >= 1".to_string(),
            ));
        }

        let mut seen_ids = HashSet::new();
        let mut seen_labels = HashSet::new();
        for shard in &topology {
            if !seen_ids.insert(shard.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate shard id {}",
                    shard.id
                )));
            }
            if !seen_labels.insert(shard.label.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate shard label '{}'",
                    shard.label
                )));
            }
        }

        let mut ring = BTreeMap::new();
        for shard in &topology {
            for vnode in 0..virtual_nodes {
                ring.insert(vnode_position(shard.id, vnode), shard.id);
            }
        }

        let shards = topology
            .into_iter()
            .map(|shard| (shard.id, shard))
            .collect();

        Ok(Self { ring, shards })
    }

    /// Number of shards in the topology.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard ids in ascending order.
    #[must_use]
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl ShardingAlgorithm for ConsistentHashSharding {
    fn shard_for(&self, key: &str) -> Option<TileServerShard> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = fnv1a_hash(key.as_bytes());
        // First virtual node at or after the key's position, wrapping to the
        // ring start when past the last position.
        let id = self
            .ring
            .range(hash..)
            .next()
            .map(|(_, id)| *id)
            .or_else(|| self.ring.values().next().copied())?;
        self.shards.get(&id).cloned()
    }
}

/// Ring position for one virtual node of a shard.
fn vnode_position(shard: ShardId, vnode: u32) -> u64 {
    let shard_hash = fnv1a_hash(format!("shard-{shard}").as_bytes());
    // Golden-ratio mixing spreads virtual positions across the ring
    let mixed = shard_hash.wrapping_add(u64::from(vnode).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    fnv1a_hash(&mixed.to_le_bytes())
}

/// FNV-1a 64-bit hash.
fn fnv1a_hash(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
