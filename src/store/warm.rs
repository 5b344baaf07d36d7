/// Warm tier: quantized recent history.
///
/// Records age here out of hot once they fall outside the retention
/// window. The full-precision embedding is dropped on entry and replaced
/// by an i8 scalar quantization, cutting the vector footprint to a quarter
/// while keeping the record searchable.
///
/// Search dequantizes the stored codes and scores with cosine similarity,
/// so ranking is approximate relative to hot-tier ranking with a bounded
/// error of one quantization step per component. There is deliberately no
/// full-precision re-rank: the full-precision vector no longer exists at
/// this tier, which is the tier's cost contract.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StrataResult;
use crate::types::{Record, RecordId, Tier};
use crate::vector::{QuantizedVector, Vector};

use super::{ChecksumFields, SearchFilter, SearchHit, StorageTier, StoredEntry, rank_hits};

/// A record as the warm tier stores it: content kept, embedding quantized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmRecord {
    /// Record id
    pub id: RecordId,
    /// Owning system's key
    pub owner_key: String,
    /// Original content (still needed to summarize for cold)
    pub content: String,
    /// Lossy quantized embedding
    pub quantized: QuantizedVector,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Opaque metadata
    pub metadata: BTreeMap<String, String>,
    /// Exact-duplicate key (carried, never recomputed)
    pub content_hash: String,
    /// Near-duplicate key (carried, never recomputed)
    pub fingerprint: u64,
}

impl WarmRecord {
    /// Transform a hot record for this tier: quantize the embedding,
    /// carry everything else unchanged.
    pub fn from_hot(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            owner_key: record.owner_key.clone(),
            content: record.content.clone(),
            quantized: QuantizedVector::from_vector(&record.embedding),
            timestamp: record.timestamp,
            metadata: record.metadata.clone(),
            content_hash: record.content_hash.clone(),
            fingerprint: record.fingerprint,
        }
    }
}

impl StoredEntry for WarmRecord {
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
        self.content.len() + self.quantized.size_bytes()
    }
}

/// Quantized per-shard store.
pub struct WarmStore {
    /// id -> warm record
    records: DashMap<RecordId, WarmRecord>,
}

impl WarmStore {
    /// Create an empty warm store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Ids of records older than `cutoff` (cold candidates).
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
}

impl Default for WarmStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTier for WarmStore {
    type Entry = WarmRecord;

    fn tier(&self) -> Tier {
        Tier::Warm
    }

    fn insert(&self, entry: WarmRecord) -> StrataResult<()> {
        self.records.insert(entry.id.clone(), entry);
        Ok(())
    }

    fn delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    fn get(&self, id: &str) -> Option<WarmRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
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
                    score: query.cosine_similarity(&record.quantized.dequantize()),
                    timestamp: record.timestamp,
                    tier: Tier::Warm,
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
