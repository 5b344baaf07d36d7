/// Common types used throughout strata.
///
/// This module defines the core data model: the [`Record`] that flows
/// through ingestion, tiers, and queries; the [`Tier`] enumeration; and
/// the per-record [`TierMarker`] that names where a record's authoritative
/// copy currently lives.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::vector::{Vector, content_hash, fingerprint};

/// Unique record identifier.
pub type RecordId = String;

/// Shard identifier in `[0, shard_count)`.
pub type ShardId = u32;

/// A storage tier, trading latency for cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Full-precision vectors, fastest queries
    Hot,
    /// Quantized vectors, approximate queries
    Warm,
    /// Fingerprint + summary only, scan/export
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

impl Tier {
    /// The tier a record ages into, if any.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }
}

/// Where a record's authoritative copy currently lives.
///
/// Invariant: at steady state exactly one tier holds the record. While a
/// migration is in flight the marker is `Migrating`, the source still
/// holds the authoritative copy, and the target holds at most one
/// unverified copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierMarker {
    /// Settled in a tier
    Settled(Tier),
    /// Mid-migration; source remains authoritative until verification
    Migrating {
        /// Tier that still holds the authoritative copy
        from: Tier,
        /// Tier holding the unverified copy (if written yet)
        to: Tier,
    },
}

impl TierMarker {
    /// The tier holding the authoritative copy right now.
    pub fn authoritative_tier(&self) -> Tier {
        match self {
            TierMarker::Settled(tier) => *tier,
            TierMarker::Migrating { from, .. } => *from,
        }
    }
}

/// A memory record aggregated from an owning system.
///
/// `owner_key` is immutable and determines the shard; `content_hash` is
/// the exact-duplicate key and `fingerprint` the near-duplicate key, both
/// derived from content and therefore identical at every tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique record id
    pub id: RecordId,
    /// The owning system's key (immutable, shard-determining)
    pub owner_key: String,
    /// The record content
    pub content: String,
    /// Full-precision embedding (dropped/quantized by lower tiers)
    pub embedding: Vector,
    /// Creation time (drives aging policy)
    pub timestamp: DateTime<Utc>,
    /// Opaque key/value metadata (BTreeMap for stable checksum encoding)
    pub metadata: BTreeMap<String, String>,
    /// Exact-duplicate key (blake3 hex of content)
    pub content_hash: String,
    /// Near-duplicate key (64-bit simhash of content)
    pub fingerprint: u64,
}

impl Record {
    /// Build a record, deriving `content_hash` and `fingerprint` from the
    /// content.
    pub fn new(
        id: impl Into<RecordId>,
        owner_key: impl Into<String>,
        content: impl Into<String>,
        embedding: Vector,
        timestamp: DateTime<Utc>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        let fingerprint = fingerprint(&content);
        Self {
            id: id.into(),
            owner_key: owner_key.into(),
            content,
            embedding,
            timestamp,
            metadata,
            content_hash,
            fingerprint,
        }
    }

    /// Age of this record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }

    /// Whether the embedding was produced by the degraded-mode fallback
    /// rather than the real embedder.
    pub fn has_fallback_embedding(&self) -> bool {
        self.metadata
            .get(crate::embedder::FALLBACK_METADATA_KEY)
            .is_some_and(|v| v == "true")
    }
}
