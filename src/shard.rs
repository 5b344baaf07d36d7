//! Per-shard composition: the three tier stores plus the tier-marker
//! registry.
//!
//! A shard is an independent partition: all records of an owner live in
//! exactly one shard, and a shard's stores are only ever mutated by that
//! shard's owning context (ingestion writes hot, the aging service moves
//! between tiers under the shard's aging lock). Nothing here crosses
//! shard boundaries.

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::StrataResult;
use crate::store::{
    ColdStore, HotConfig, HotStore, SearchFilter, SearchHit, StorageTier, WarmStore, rank_hits,
};
use crate::types::{RecordId, ShardId, Tier, TierMarker};
use crate::vector::Vector;

/// Snapshot of a shard's per-tier record counts, for health queries and
/// gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHealth {
    /// Which shard
    pub shard: ShardId,
    /// Records settled in hot
    pub hot: usize,
    /// Records settled in warm
    pub warm: usize,
    /// Records settled in cold
    pub cold: usize,
    /// Records currently mid-migration
    pub migrating: usize,
}

/// One partition of the store: three tiers and the authoritative marker
/// registry.
pub struct Shard {
    /// Shard id in `[0, N)`
    id: ShardId,
    /// Full-precision tier
    pub hot: HotStore,
    /// Quantized tier
    pub warm: WarmStore,
    /// Summary-only tier
    pub cold: ColdStore,
    /// id -> authoritative tier marker
    markers: DashMap<RecordId, TierMarker>,
    /// Serializes migration passes on this shard; different shards migrate
    /// in parallel
    pub(crate) aging_lock: Mutex<()>,
}

impl Shard {
    /// Create an empty shard.
    pub fn new(id: ShardId, hot_config: HotConfig) -> Self {
        Self {
            id,
            hot: HotStore::with_config(hot_config),
            warm: WarmStore::new(),
            cold: ColdStore::new(),
            markers: DashMap::new(),
            aging_lock: Mutex::new(()),
        }
    }

    /// Shard id.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Current marker for a record, if it exists in this shard.
    pub fn marker(&self, id: &str) -> Option<TierMarker> {
        self.markers.get(id).map(|entry| *entry.value())
    }

    /// Set a record's marker.
    pub fn set_marker(&self, id: RecordId, marker: TierMarker) {
        self.markers.insert(id, marker);
    }

    /// Remove a record's marker (retention expiry only).
    pub(crate) fn remove_marker(&self, id: &str) {
        self.markers.remove(id);
    }

    /// Ids currently marked `Migrating` (crash-recovery input).
    pub fn migrating_ids(&self) -> Vec<(RecordId, Tier, Tier)> {
        self.markers
            .iter()
            .filter_map(|entry| match entry.value() {
                TierMarker::Migrating { from, to } => {
                    Some((entry.key().clone(), *from, *to))
                }
                TierMarker::Settled(_) => None,
            })
            .collect()
    }

    /// Which tier stores physically hold this record right now.
    ///
    /// Steady-state invariant: exactly one. During a migration: the source
    /// plus possibly one unverified target copy. Never zero for a record
    /// with a marker.
    pub fn tiers_holding(&self, id: &str) -> Vec<Tier> {
        let mut tiers = Vec::new();
        if self.hot.peek(id).is_some() {
            tiers.push(Tier::Hot);
        }
        if self.warm.get(id).is_some() {
            tiers.push(Tier::Warm);
        }
        if self.cold.get(id).is_some() {
            tiers.push(Tier::Cold);
        }
        tiers
    }

    /// Similarity search over this shard's queryable tiers (hot + warm).
    ///
    /// Queries do not take the aging lock, so a record mid-migration can be
    /// present in both stores at once. The hot copy is the authoritative
    /// one until the migration commits; the warm duplicate is dropped so a
    /// record never surfaces twice or crowds out the k-th result.
    pub fn search(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<Vec<SearchHit>> {
        let mut hits = self.hot.search_similar(query, k, filter)?;
        let mut warm_hits = self.warm.search_similar(query, k, filter)?;
        warm_hits.retain(|warm| hits.iter().all(|hot| hot.id != warm.id));
        hits.extend(warm_hits);
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Per-tier counts for health and gauges.
    pub fn health(&self) -> ShardHealth {
        let migrating = self
            .markers
            .iter()
            .filter(|entry| matches!(entry.value(), TierMarker::Migrating { .. }))
            .count();
        ShardHealth {
            shard: self.id,
            hot: self.hot.len(),
            warm: self.warm.len(),
            cold: self.cold.len(),
            migrating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WarmRecord;
    use crate::types::Record;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(id: &str, embedding: Vec<f32>) -> Record {
        Record::new(
            id,
            "sys-a",
            format!("content for {id}"),
            Vector::new(embedding),
            Utc::now(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_search_unions_hot_and_warm() {
        let shard = Shard::new(0, HotConfig::default());
        shard.hot.insert(record("hot-1", vec![1.0, 0.0])).unwrap();
        shard
            .warm
            .insert(WarmRecord::from_hot(&record("warm-1", vec![0.9, 0.1])))
            .unwrap();

        let hits = shard
            .search(&Vector::new(vec![1.0, 0.0]), 10, &SearchFilter::default())
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert!(ids.contains(&"hot-1"));
        assert!(ids.contains(&"warm-1"));
    }

    #[test]
    fn test_search_returns_mid_migration_record_once() {
        // Between the target write and the source delete a record is held
        // by both hot and warm; a query must surface it exactly once, from
        // the authoritative hot copy, without eating a second result slot.
        let shard = Shard::new(0, HotConfig::default());
        let r1 = record("r1", vec![1.0, 0.0]);
        shard.warm.insert(WarmRecord::from_hot(&r1)).unwrap();
        shard.hot.insert(r1).unwrap();
        shard.set_marker(
            "r1".to_string(),
            TierMarker::Migrating {
                from: Tier::Hot,
                to: Tier::Warm,
            },
        );
        shard.hot.insert(record("r2", vec![0.8, 0.2])).unwrap();
        shard.set_marker("r2".to_string(), TierMarker::Settled(Tier::Hot));

        let hits = shard
            .search(&Vector::new(vec![1.0, 0.0]), 2, &SearchFilter::default())
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(hits[0].tier, Tier::Hot);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let shard = Shard::new(0, HotConfig::default());
        for i in 0..5 {
            shard
                .hot
                .insert(record(&format!("r{i}"), vec![1.0, i as f32 / 10.0]))
                .unwrap();
        }
        let hits = shard
            .search(&Vector::new(vec![1.0, 0.0]), 3, &SearchFilter::default())
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_tiers_holding_and_markers() {
        let shard = Shard::new(2, HotConfig::default());
        let r = record("r1", vec![1.0]);
        shard.hot.insert(r).unwrap();
        shard.set_marker("r1".to_string(), TierMarker::Settled(Tier::Hot));

        assert_eq!(shard.tiers_holding("r1"), vec![Tier::Hot]);
        assert_eq!(shard.marker("r1"), Some(TierMarker::Settled(Tier::Hot)));
        assert_eq!(shard.migrating_ids().len(), 0);
    }

    #[test]
    fn test_health_counts() {
        let shard = Shard::new(1, HotConfig::default());
        shard.hot.insert(record("a", vec![1.0])).unwrap();
        shard.set_marker("a".to_string(), TierMarker::Settled(Tier::Hot));
        shard.set_marker(
            "b".to_string(),
            TierMarker::Migrating {
                from: Tier::Hot,
                to: Tier::Warm,
            },
        );

        let health = shard.health();
        assert_eq!(health.shard, 1);
        assert_eq!(health.hot, 1);
        assert_eq!(health.migrating, 1);
    }
}
