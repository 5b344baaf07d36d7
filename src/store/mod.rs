//! Per-shard storage tiers.
//!
//! Each shard owns one store per tier. The tiers share the
//! [`StorageTier`] contract (insert / delete / get / search_similar,
//! scoped strictly to that shard's data) but differ in what they keep:
//!
//! | Tier | Precision | Query capability |
//! |------|-----------|------------------|
//! | Hot  | full-precision vector | approximate top-k similarity |
//! | Warm | quantized vector (lossy) | approximate top-k similarity |
//! | Cold | fingerprint + summary | scan/export only |
//!
//! The [`StoredEntry`] trait exposes the tier-invariant projection of a
//! record (id, owner, content hash, fingerprint, timestamp, metadata) that
//! migration checksums are computed over: a record transformed for a lower
//! tier must checksum identically to its source, or the migration aborts.

mod cold;
mod hot;
mod warm;

pub use cold::{ColdRecord, ColdStore};
pub use hot::{HotConfig, HotStore};
pub use warm::{WarmRecord, WarmStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StrataResult;
use crate::types::{RecordId, Tier};
use crate::vector::Vector;

/// One result of a similarity search, ready for cross-shard merging.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// The matching record
    pub id: RecordId,
    /// Cosine similarity to the query (higher is better)
    pub score: f32,
    /// Record timestamp (merge tie-breaker)
    pub timestamp: DateTime<Utc>,
    /// Tier the hit came from
    pub tier: Tier,
}

/// Filters applied during a tier search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Inclusive timestamp range
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Restrict to one owner's records
    pub owner_key: Option<String>,
}

impl SearchFilter {
    /// Whether a record with this timestamp/owner passes the filter.
    pub fn matches(&self, timestamp: DateTime<Utc>, owner_key: &str) -> bool {
        if let Some((start, end)) = self.time_range
            && (timestamp < start || timestamp > end)
        {
            return false;
        }
        if let Some(ref owner) = self.owner_key
            && owner != owner_key
        {
            return false;
        }
        true
    }
}

/// The tier-invariant projection of a record.
///
/// Everything a migration must carry unchanged; the embedding is absent by
/// design (lossy compression is exempt from the integrity check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumFields {
    /// Record id
    pub id: RecordId,
    /// Owning system's key
    pub owner_key: String,
    /// Exact-duplicate key
    pub content_hash: String,
    /// Near-duplicate key
    pub fingerprint: u64,
    /// Creation time, microsecond precision
    pub timestamp_micros: i64,
    /// Opaque metadata (BTreeMap gives a stable encoding order)
    pub metadata: BTreeMap<String, String>,
}

impl ChecksumFields {
    /// CRC32 over the canonical bincode encoding.
    ///
    /// Two entries representing the same record at different tiers must
    /// produce the same checksum; any divergence aborts the migration.
    pub fn checksum(&self) -> u32 {
        let encoded = bincode::serialize(self).unwrap_or_default();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&encoded);
        hasher.finalize()
    }
}

/// Common surface of every tier's stored representation.
pub trait StoredEntry {
    /// Record id.
    fn id(&self) -> &RecordId;
    /// Owning system's key.
    fn owner_key(&self) -> &str;
    /// Creation time.
    fn timestamp(&self) -> DateTime<Utc>;
    /// Tier-invariant projection for migration checksums.
    fn checksum_fields(&self) -> ChecksumFields;
    /// Approximate storage footprint in bytes (for migration stats).
    fn approx_bytes(&self) -> usize;
}

/// Contract shared by all three tier stores.
///
/// The associated `Entry` is the tier's own representation: full records
/// in hot, quantized in warm, summary-only in cold. Tiers that cannot
/// serve similarity queries return [`crate::StrataError::Unsupported`]
/// from `search_similar` rather than silently returning nothing.
pub trait StorageTier: Send + Sync {
    /// This tier's stored representation.
    type Entry: StoredEntry;

    /// Which tier this store is.
    fn tier(&self) -> Tier;

    /// Insert (or overwrite) an entry.
    fn insert(&self, entry: Self::Entry) -> StrataResult<()>;

    /// Remove an entry; returns whether it existed.
    fn delete(&self, id: &str) -> bool;

    /// Fetch an entry.
    fn get(&self, id: &str) -> Option<Self::Entry>;

    /// Ranked top-k similarity search over this shard's slice of the tier.
    fn search_similar(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<Vec<SearchHit>>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the store holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All record ids currently stored.
    fn record_ids(&self) -> Vec<RecordId>;
}

/// Rank hits: score descending, then most-recent timestamp, then id
/// ascending. Total and deterministic, so merged shard results are stable.
pub(crate) fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });
}
