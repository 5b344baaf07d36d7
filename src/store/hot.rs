/// Hot tier: full-precision working set.
///
/// Everything lives in RAM at full precision, so this tier serves both the
/// lowest-latency similarity searches and ingestion's duplicate checks
/// (exact content-hash lookups and near-duplicate fingerprint probes).
///
/// Search is a flat cosine scan: exact top-k within the shard, O(n) per
/// query, which comfortably meets the hot-tier latency target at per-shard
/// working-set sizes. Aging keeps the working set bounded by migrating old
/// records to warm.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StrataResult;
use crate::types::{Record, RecordId, Tier};
use crate::vector::{Vector, fingerprint_distance};

use super::{ChecksumFields, SearchFilter, SearchHit, StorageTier, StoredEntry, rank_hits};

/// Hot store configuration.
#[derive(Debug, Clone)]
pub struct HotConfig {
    /// Soft capacity; exceeding it signals pressure but never rejects a
    /// write (aging, not the writer, is responsible for shrinking)
    pub target_capacity: usize,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            target_capacity: 10_000,
        }
    }
}

/// Full-precision per-shard store.
pub struct HotStore {
    config: HotConfig,

    /// id -> full record
    records: DashMap<RecordId, Record>,

    /// content_hash -> id (exact-duplicate index)
    by_content_hash: DashMap<String, RecordId>,

    /// id -> reads since insertion (feeds the aging policy's access gate)
    access_counts: DashMap<RecordId, u64>,

    /// Statistics
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HotStore {
    /// Create an empty hot store with default configuration.
    pub fn new() -> Self {
        Self::with_config(HotConfig::default())
    }

    /// Create an empty hot store.
    pub fn with_config(config: HotConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            by_content_hash: DashMap::new(),
            access_counts: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether an exact duplicate of this content is already stored.
    pub fn contains_content_hash(&self, content_hash: &str) -> bool {
        self.by_content_hash.contains_key(content_hash)
    }

    /// Smallest hamming distance between `fp` and any stored fingerprint.
    ///
    /// `None` when the store is empty. Ingestion treats distances at or
    /// under its threshold as near-duplicates.
    pub fn nearest_fingerprint_distance(&self, fp: u64) -> Option<u32> {
        self.records
            .iter()
            .map(|entry| fingerprint_distance(entry.value().fingerprint, fp))
            .min()
    }

    /// Read a record without touching the access count or hit/miss stats.
    ///
    /// Migration, recovery, and inspection paths read through this so the
    /// aging policy's access gate only ever sees caller traffic.
    pub fn peek(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    /// Reads of this record since insertion.
    pub fn access_count(&self, id: &str) -> u64 {
        self.access_counts.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Ids of records older than `cutoff` (aging candidates).
    pub fn ids_older_than(&self, cutoff: DateTime<Utc>) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .records
            .iter()
            .filter(|entry| entry.value().timestamp < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether the working set is over its soft capacity.
    pub fn over_capacity(&self) -> bool {
        self.records.len() > self.config.target_capacity
    }

    /// Hit/miss counters (hits, misses).
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for HotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTier for HotStore {
    type Entry = Record;

    fn tier(&self) -> Tier {
        Tier::Hot
    }

    fn insert(&self, record: Record) -> StrataResult<()> {
        self.by_content_hash
            .insert(record.content_hash.clone(), record.id.clone());
        self.access_counts.insert(record.id.clone(), 0);
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn delete(&self, id: &str) -> bool {
        let removed = self.records.remove(id);
        if let Some((_, record)) = &removed {
            self.by_content_hash.remove(&record.content_hash);
            self.access_counts.remove(id);
        }
        removed.is_some()
    }

    fn get(&self, id: &str) -> Option<Record> {
        let found = self.records.get(id).map(|entry| entry.value().clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(mut count) = self.access_counts.get_mut(id) {
                *count += 1;
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn search_similar(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<Vec<SearchHit>> {
        let mut hits: Vec<SearchHit> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                filter.matches(record.timestamp, &record.owner_key)
            })
            .map(|entry| {
                let record = entry.value();
                SearchHit {
                    id: record.id.clone(),
                    score: query.cosine_similarity(&record.embedding),
                    timestamp: record.timestamp,
                    tier: Tier::Hot,
                }
            })
            .collect();

        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn record_ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl StoredEntry for Record {
    fn id(&self) -> &RecordId {
        &self.id
    }

    fn owner_key(&self) -> &str {
        &self.owner_key
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn checksum_fields(&self) -> ChecksumFields {
        ChecksumFields {
            id: self.id.clone(),
            owner_key: self.owner_key.clone(),
            content_hash: self.content_hash.clone(),
            fingerprint: self.fingerprint,
            timestamp_micros: self.timestamp.timestamp_micros(),
            metadata: self.metadata.clone(),
        }
    }

    fn approx_bytes(&self) -> usize {
        self.content.len() + self.embedding.dimensions() * std::mem::size_of::<f32>()
    }
}
