//! Deterministic owner-to-shard routing.
//!
//! The router is a pure derivation: no I/O, no errors, no state beyond the
//! precomputed ring. `shard_for` must return the same shard for the same
//! owner key across calls, threads, and process restarts, so ring points
//! are blake3-derived (stable) rather than hashed with the std hasher
//! (randomized per process).
//!
//! A consistent-hash ring with virtual nodes is used instead of plain
//! `hash % N` so that growing the shard count moves only the owners whose
//! ring points land on the new shard's arcs (expected `1/(N+1)` of data),
//! not a full re-shuffle. Changing the shard count is still an explicit
//! rebuild: construct a new router and migrate the affected owners.

use std::collections::BTreeMap;

use crate::types::ShardId;

/// Virtual nodes per shard. More points smooth the key distribution at the
/// cost of a larger (still tiny) ring.
const VIRTUAL_NODES: u32 = 64;

/// Maps an owner key to the shard that owns all of that owner's records.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    /// Number of shards `N`; shard ids are `[0, N)`
    shard_count: u32,
    /// Ring point -> shard id
    ring: BTreeMap<u64, ShardId>,
}

impl ShardRouter {
    /// Build a router over `shard_count` shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is zero.
    pub fn new(shard_count: u32) -> Self {
        assert!(shard_count > 0, "shard_count must be at least 1");

        let mut ring = BTreeMap::new();
        for shard in 0..shard_count {
            for vnode in 0..VIRTUAL_NODES {
                let point = ring_point(&format!("shard-{shard}-vnode-{vnode}"));
                ring.insert(point, shard);
            }
        }

        Self { shard_count, ring }
    }

    /// The shard owning `owner_key`. Pure and deterministic.
    pub fn shard_for(&self, owner_key: &str) -> ShardId {
        let point = ring_point(owner_key);
        // First ring point at or after the key's point, wrapping to the
        // ring start.
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &shard)| shard)
            .unwrap_or(0)
    }

    /// Number of shards `N`.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// All shard ids, for fan-out target resolution.
    pub fn all_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        0..self.shard_count
    }
}

/// Stable 64-bit ring point for a key.
fn ring_point(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap_or([0u8; 8]))
}
