/// Cold tier: fingerprints and summaries only.
///
/// The cheapest tier. Embeddings are gone entirely; what remains is the
/// tier-invariant projection (hashes, fingerprint, metadata) plus a short
/// content summary. Consequently there is no similarity search here —
/// `search_similar` refuses rather than pretending — only scan/export and
/// retention expiry.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{StrataError, StrataResult};
use crate::types::{RecordId, Tier};
use crate::vector::Vector;

use super::{ChecksumFields, SearchFilter, SearchHit, StorageTier, StoredEntry, WarmRecord};

/// Maximum summary length in characters.
const SUMMARY_CHARS: usize = 240;

/// A record as the cold tier stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRecord {
    /// Record id
    pub id: RecordId,
    /// Owning system's key
    pub owner_key: String,
    /// Short content summary (first [`SUMMARY_CHARS`] chars)
    pub summary: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Opaque metadata
    pub metadata: BTreeMap<String, String>,
    /// Exact-duplicate key (carried, never recomputed)
    pub content_hash: String,
    /// Near-duplicate key (carried, never recomputed)
    pub fingerprint: u64,
}

impl ColdRecord {
    /// Transform a warm record for this tier: drop the vector, summarize
    /// the content, carry the invariant fields unchanged.
    pub fn from_warm(record: &WarmRecord) -> Self {
        Self {
            id: record.id.clone(),
            owner_key: record.owner_key.clone(),
            summary: summarize(&record.content),
            timestamp: record.timestamp,
            metadata: record.metadata.clone(),
            content_hash: record.content_hash.clone(),
            fingerprint: record.fingerprint,
        }
    }
}

/// Truncate content to a summary at a char boundary.
fn summarize(content: &str) -> String {
    content.chars().take(SUMMARY_CHARS).collect()
}

impl StoredEntry for ColdRecord {
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
        self.summary.len() + self.content_hash.len()
    }
}

/// Summary-only per-shard store.
pub struct ColdStore {
    /// id -> cold record
    records: DashMap<RecordId, ColdRecord>,
}

impl ColdStore {
    /// Create an empty cold store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// All records, ordered by id, for export.
    pub fn scan(&self) -> Vec<ColdRecord> {
        let mut records: Vec<ColdRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Serialize every record (id order) as newline-delimited JSON, for
    /// offline archival or bulk transfer.
    pub fn export(&self) -> StrataResult<String> {
        let mut out = String::new();
        for record in self.scan() {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Retention expiry: delete every record older than `cutoff` and
    /// return their ids so the shard can drop the tier markers too.
    ///
    /// Cold is the terminal tier, so no migration commit ever deletes from
    /// it; retention expiry is the only way a cold record leaves.
    pub fn expire_before(&self, cutoff: DateTime<Utc>) -> Vec<RecordId> {
        let expired: Vec<RecordId> = self
            .records
            .iter()
            .filter(|entry| entry.value().timestamp < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.records.remove(id);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "cold retention expiry");
        }
        expired
    }
}

impl Default for ColdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTier for ColdStore {
    type Entry = ColdRecord;

    fn tier(&self) -> Tier {
        Tier::Cold
    }

    fn insert(&self, entry: ColdRecord) -> StrataResult<()> {
        self.records.insert(entry.id.clone(), entry);
        Ok(())
    }

    fn delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    fn get(&self, id: &str) -> Option<ColdRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    /// Cold has no vectors; similarity queries are refused explicitly so a
    /// caller can never mistake "tier can't search" for "no matches".
    fn search_similar(
        &self,
        _query: &Vector,
        _k: usize,
        _filter: &SearchFilter,
    ) -> StrataResult<Vec<SearchHit>> {
        Err(StrataError::Unsupported {
            operation: "search_similar".to_string(),
            tier: Tier::Cold.to_string(),
        })
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn record_ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Record;

    fn warm_record(id: &str, content: &str) -> WarmRecord {
        let hot = Record::new(
            id,
            "sys-a",
            content,
            Vector::new(vec![0.3, 0.7]),
            Utc::now(),
            BTreeMap::new(),
        );
        WarmRecord::from_hot(&hot)
    }

    #[test]
    fn test_from_warm_preserves_invariant_fields() {
        let warm = warm_record("r1", "the full original content of this record");
        let cold = ColdRecord::from_warm(&warm);

        assert_eq!(cold.checksum_fields(), warm.checksum_fields());
        assert_eq!(
            cold.checksum_fields().checksum(),
            warm.checksum_fields().checksum()
        );
    }

    #[test]
    fn test_summary_truncated() {
        let long = "x".repeat(1000);
        let warm = warm_record("r1", &long);
        let cold = ColdRecord::from_warm(&warm);
        assert_eq!(cold.summary.chars().count(), SUMMARY_CHARS);
    }

    #[test]
    fn test_search_similar_unsupported() {
        let store = ColdStore::new();
        let result = store.search_similar(&Vector::new(vec![1.0]), 5, &SearchFilter::default());
        assert!(matches!(result, Err(StrataError::Unsupported { .. })));
    }

    #[test]
    fn test_scan_ordered_by_id() {
        let store = ColdStore::new();
        store.insert(ColdRecord::from_warm(&warm_record("b", "x"))).unwrap();
        store.insert(ColdRecord::from_warm(&warm_record("a", "y"))).unwrap();

        let scanned = store.scan();
        assert_eq!(scanned[0].id, "a");
        assert_eq!(scanned[1].id, "b");
    }

    #[test]
    fn test_export_round_trips_records() {
        let store = ColdStore::new();
        store.insert(ColdRecord::from_warm(&warm_record("r1", "alpha"))).unwrap();
        store.insert(ColdRecord::from_warm(&warm_record("r2", "beta"))).unwrap();

        let exported = store.export().unwrap();
        let lines: Vec<ColdRecord> = exported
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], store.get("r1").unwrap());
        assert_eq!(lines[1], store.get("r2").unwrap());
    }

    #[test]
    fn test_expire_before_deletes_only_old() {
        let store = ColdStore::new();
        let mut old = ColdRecord::from_warm(&warm_record("old", "x"));
        old.timestamp = Utc::now() - chrono::Duration::days(400);
        store.insert(old).unwrap();
        store.insert(ColdRecord::from_warm(&warm_record("new", "y"))).unwrap();

        let expired = store.expire_before(Utc::now() - chrono::Duration::days(365));
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }
}
