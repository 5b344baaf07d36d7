//! # Strata — Tiered Memory Storage Engine
//!
//! Strata keeps large memory corpora queryable while bounding the cost of
//! old data. Records flow through three tiers:
//!
//! - **Hot** — full-precision vectors, fast similarity search
//! - **Warm** — quantized vectors, cheaper storage, still searchable
//! - **Cold** — fingerprint and summary only, scan/export
//!
//! An owner key pins all of a system's records to one shard via a
//! consistent-hash ring, so per-owner dedup and queries never cross
//! shards. A background aging service demotes records down the tiers with
//! a verified, crash-recoverable migration protocol. Queries fan out
//! across shards with per-shard timeouts and return partial results when
//! shards misbehave.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata::{
//!     HashEmbedder, MemoryObjectStore, NoopMetrics, SearchFilter, Strata,
//!     StrataConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Strata::new(
//!         StrataConfig::default(),
//!         Arc::new(MemoryObjectStore::new()),
//!         Arc::new(HashEmbedder::new(128)),
//!         Arc::new(NoopMetrics),
//!     );
//!
//!     // Settle anything a previous crash left mid-migration.
//!     engine.recover().await?;
//!
//!     // Pull pending uploads from object storage into the hot tier.
//!     let report = engine.ingest_pending().await?;
//!     println!("stored {} records", report.stored);
//!
//!     // Search across every shard.
//!     let embedder = HashEmbedder::new(128);
//!     let query = embedder.embed("what happened last winter?").await?;
//!     let answer = engine.search(&query, 10, &SearchFilter::default()).await?;
//!     for hit in answer.results {
//!         println!("{} ({:.3}, {})", hit.id, hit.score, hit.tier);
//!     }
//!
//!     // Age old records down the tiers.
//!     let stats = engine.run_aging_pass().await?;
//!     println!("migrated {} records", stats.moved);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Facade** ([`Strata`]) — assembles everything behind one handle
//! 2. **Ingestion** ([`IngestionCoordinator`]) — object storage to hot
//!    tier, with dedup, a worker pool, and a commit-marker protocol
//! 3. **Aging** ([`AgingService`]) — verified tier migrations and crash
//!    recovery
//! 4. **Query** ([`DistributedQueryEngine`]) — bounded-latency fan-out
//!    with deterministic merging
//! 5. **Shards and tiers** ([`Shard`], [`HotStore`], [`WarmStore`],
//!    [`ColdStore`]) — the data plane
//!
//! External collaborators (object store, embedding model) sit behind
//! [`CircuitBreaker`]s; transient failures are retried with backoff and a
//! persistent outage fails fast instead of piling up work.

pub mod aging;
pub mod breaker;
pub mod embedder;
pub mod error;
pub mod fabric;
pub mod ingest;
pub mod metrics;
pub mod object_store;
pub mod query;
pub mod routing;
pub mod shard;
pub mod store;
pub mod types;
pub mod vector;

pub use aging::{AgingConfig, AgingService, MigrationJob, MigrationStats, MigrationStatus};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
pub use embedder::{Embedder, FALLBACK_METADATA_KEY, HashEmbedder};
pub use error::{StrataError, StrataResult};
pub use fabric::{Strata, StrataConfig};
pub use ingest::{
    DeadLetter, IngestConfig, IngestOutcome, IngestReport, IngestionCoordinator, UploadDescriptor,
};
pub use metrics::{MetricsSink, NoopMetrics, RecordingMetrics};
pub use object_store::{MemoryObjectStore, ObjectStore};
pub use query::{DistributedQueryEngine, QueryConfig, QueryResult, ShardReader};
pub use routing::ShardRouter;
pub use shard::{Shard, ShardHealth};
pub use store::{
    ColdRecord, ColdStore, HotConfig, HotStore, SearchFilter, SearchHit, StorageTier, StoredEntry,
    WarmRecord, WarmStore,
};
pub use types::{Record, RecordId, ShardId, Tier, TierMarker};
pub use vector::{QuantizedVector, Vector, content_hash, fingerprint, fingerprint_distance};
