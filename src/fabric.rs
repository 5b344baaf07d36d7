//! The assembled engine.
//!
//! [`Strata`] wires the router, shards, ingestion coordinator, aging
//! service, and query engine together behind one handle: ingest from
//! object storage, age records down the tiers, query across shards, and
//! observe health. External collaborators (object store, embedder) sit
//! behind their own circuit breakers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::aging::{AgingConfig, AgingService, MigrationStats};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::embedder::Embedder;
use crate::error::StrataResult;
use crate::ingest::{IngestConfig, IngestReport, IngestionCoordinator};
use crate::metrics::MetricsSink;
use crate::object_store::ObjectStore;
use crate::query::{DistributedQueryEngine, QueryConfig, QueryResult, ShardReader};
use crate::routing::ShardRouter;
use crate::shard::{Shard, ShardHealth};
use crate::store::{HotConfig, SearchFilter};
use crate::vector::Vector;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    /// Number of shards (fixed for the engine's lifetime)
    pub shard_count: u32,
    /// Hot-tier settings, applied per shard
    pub hot: HotConfig,
    /// Ingestion settings
    pub ingest: IngestConfig,
    /// Aging policy
    pub aging: AgingConfig,
    /// Query fan-out settings
    pub query: QueryConfig,
    /// Breaker settings, applied to each external dependency
    pub breaker: CircuitBreakerConfig,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            hot: HotConfig::default(),
            ingest: IngestConfig::default(),
            aging: AgingConfig::default(),
            query: QueryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Tiered, sharded memory storage engine.
pub struct Strata {
    router: Arc<ShardRouter>,
    shards: Vec<Arc<Shard>>,
    coordinator: Arc<IngestionCoordinator>,
    aging: Arc<AgingService>,
    queries: DistributedQueryEngine,
    store_breaker: Arc<CircuitBreaker>,
    embed_breaker: Arc<CircuitBreaker>,
}

impl Strata {
    /// Assemble an engine over the given collaborators.
    pub fn new(
        config: StrataConfig,
        object_store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn Embedder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let router = Arc::new(ShardRouter::new(config.shard_count));
        let shards: Vec<Arc<Shard>> = (0..config.shard_count)
            .map(|id| Arc::new(Shard::new(id, config.hot.clone())))
            .collect();

        let store_breaker = Arc::new(CircuitBreaker::new(
            "object_store",
            config.breaker.clone(),
            Arc::clone(&metrics),
        ));
        let embed_breaker = Arc::new(CircuitBreaker::new(
            "embedder",
            config.breaker.clone(),
            Arc::clone(&metrics),
        ));

        let coordinator = Arc::new(IngestionCoordinator::new(
            Arc::clone(&router),
            shards.clone(),
            object_store,
            embedder,
            Arc::clone(&store_breaker),
            Arc::clone(&embed_breaker),
            config.ingest,
            Arc::clone(&metrics),
        ));

        let aging = Arc::new(AgingService::new(
            shards.clone(),
            config.aging,
            Arc::clone(&metrics),
        ));

        let readers: Vec<Arc<dyn ShardReader>> = shards
            .iter()
            .map(|shard| Arc::clone(shard) as Arc<dyn ShardReader>)
            .collect();
        let queries =
            DistributedQueryEngine::new(Arc::clone(&router), readers, config.query, metrics);

        info!(shards = config.shard_count, "engine assembled");
        Self {
            router,
            shards,
            coordinator,
            aging,
            queries,
            store_breaker,
            embed_breaker,
        }
    }

    /// Ingest every pending upload from object storage.
    pub async fn ingest_pending(&self) -> StrataResult<IngestReport> {
        Arc::clone(&self.coordinator).run_once().await
    }

    /// Run one aging pass over all shards.
    pub async fn run_aging_pass(&self) -> StrataResult<MigrationStats> {
        self.aging.run_pass().await
    }

    /// Start the periodic aging loop. [`Strata::shutdown`] stops it; the
    /// returned handle resolves once the loop exits.
    pub fn start_background_aging(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.aging).spawn()
    }

    /// Settle any migrations interrupted by a crash. Call once at
    /// startup, before the first aging pass.
    pub async fn recover(&self) -> StrataResult<usize> {
        let mut settled = 0;
        for shard in &self.shards {
            settled += self.aging.recover(shard).await?;
        }
        Ok(settled)
    }

    /// Top-k similarity search across the hot and warm tiers.
    pub async fn search(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<QueryResult> {
        self.queries.search(query, k, filter).await
    }

    /// Expire cold records older than the cutoff. Returns how many were
    /// dropped.
    pub fn expire_cold(&self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for shard in &self.shards {
            let expired = shard.cold.expire_before(cutoff);
            for id in &expired {
                shard.remove_marker(id);
            }
            dropped += expired.len();
        }
        dropped
    }

    /// Per-shard record counts and migration activity.
    pub fn shard_health(&self) -> Vec<ShardHealth> {
        self.shards.iter().map(|shard| shard.health()).collect()
    }

    /// Administrative breaker reset after a dependency is fixed.
    pub fn reset_breakers(&self) {
        self.store_breaker.force_reset();
        self.embed_breaker.force_reset();
    }

    /// The shard an owner key routes to.
    pub fn shard_for(&self, owner_key: &str) -> u32 {
        self.router.shard_for(owner_key)
    }

    /// Direct shard access, for inspection and tests.
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Ingestion coordinator handle.
    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.coordinator
    }

    /// Aging service handle.
    pub fn aging(&self) -> &Arc<AgingService> {
        &self.aging
    }

    /// Graceful shutdown: stop aging, refuse new uploads, drain in-flight
    /// ingestion. Returns `false` if the drain timed out.
    pub async fn shutdown(&self) -> bool {
        self.aging.stop();
        let drained = self.coordinator.shutdown().await;
        info!(drained, "engine shut down");
        drained
    }
}
