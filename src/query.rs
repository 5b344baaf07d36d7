//! Distributed similarity queries.
//!
//! A query fans out to every shard that can hold matching records (one
//! shard when an owner filter pins it, all shards otherwise), runs each
//! shard's search on the blocking pool under a per-shard timeout, then
//! merges the partial results deterministically: score descending, then
//! timestamp descending, then id ascending.
//!
//! A shard that times out or errors is dropped from the merge and reported
//! in `degraded_shards`; partial results are still returned. Only when
//! every targeted shard fails does the query itself fail. An overall query
//! budget bounds the whole fan-out regardless of shard count.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{StrataError, StrataResult};
use crate::metrics::{MetricsSink, names};
use crate::routing::ShardRouter;
use crate::shard::Shard;
use crate::store::{SearchFilter, SearchHit, rank_hits};
use crate::types::ShardId;
use crate::vector::Vector;

/// Query fan-out configuration.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Budget for a single shard's search
    pub per_shard_timeout: std::time::Duration,

    /// Budget for the whole query, all shards included
    pub query_budget: std::time::Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            per_shard_timeout: std::time::Duration::from_millis(250),
            query_budget: std::time::Duration::from_secs(2),
        }
    }
}

/// Read surface a query needs from a shard.
///
/// `Shard` is the production implementation; tests substitute readers
/// that stall or fail to exercise the degraded paths.
pub trait ShardReader: Send + Sync {
    /// Which shard this reader serves.
    fn shard_id(&self) -> ShardId;

    /// Top-k similarity search over this shard only.
    fn search(&self, query: &Vector, k: usize, filter: &SearchFilter)
    -> StrataResult<Vec<SearchHit>>;
}

impl ShardReader for Shard {
    fn shard_id(&self) -> ShardId {
        self.id()
    }

    fn search(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<Vec<SearchHit>> {
        Shard::search(self, query, k, filter)
    }
}

/// A merged, possibly partial, query answer.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Top-k hits across the responding shards
    pub results: Vec<SearchHit>,
    /// Shards that timed out or errored, ascending
    pub degraded_shards: Vec<ShardId>,
}

impl QueryResult {
    /// Whether every targeted shard answered.
    pub fn is_complete(&self) -> bool {
        self.degraded_shards.is_empty()
    }
}

/// Fans similarity queries out across shards and merges the answers.
pub struct DistributedQueryEngine {
    router: Arc<ShardRouter>,
    readers: Vec<Arc<dyn ShardReader>>,
    config: QueryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl DistributedQueryEngine {
    /// Wire up an engine. Readers must be indexed by shard id.
    pub fn new(
        router: Arc<ShardRouter>,
        readers: Vec<Arc<dyn ShardReader>>,
        config: QueryConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        debug_assert_eq!(router.shard_count() as usize, readers.len());
        Self {
            router,
            readers,
            config,
            metrics,
        }
    }

    /// Top-k similarity search.
    ///
    /// An owner filter pins the query to that owner's shard; otherwise all
    /// shards are searched. Returns partial results with the failed shards
    /// listed, or [`StrataError::AllShardsUnavailable`] if no shard
    /// answered.
    pub async fn search(
        &self,
        query: &Vector,
        k: usize,
        filter: &SearchFilter,
    ) -> StrataResult<QueryResult> {
        if k == 0 {
            return Ok(QueryResult {
                results: Vec::new(),
                degraded_shards: Vec::new(),
            });
        }
        let started = Instant::now();
        let deadline = started + self.config.query_budget;

        let targets: Vec<ShardId> = match &filter.owner_key {
            Some(owner) => vec![self.router.shard_for(owner)],
            None => self.router.all_shards().collect(),
        };

        let mut tasks = JoinSet::new();
        for &shard_id in &targets {
            let reader = Arc::clone(&self.readers[shard_id as usize]);
            let query = query.clone();
            let filter = filter.clone();
            let per_shard = self.config.per_shard_timeout;
            tasks.spawn(async move {
                // Shard searches are CPU-bound scans; run them off the
                // async threads so a slow shard can't stall its peers.
                let searched = timeout(
                    per_shard,
                    tokio::task::spawn_blocking(move || reader.search(&query, k, &filter)),
                )
                .await;
                let outcome = match searched {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(StrataError::TransientIo {
                        dependency: format!("shard-{shard_id}"),
                        reason: join_err.to_string(),
                    }),
                    Err(_) => Err(StrataError::TransientIo {
                        dependency: format!("shard-{shard_id}"),
                        reason: "per-shard timeout".to_string(),
                    }),
                };
                (shard_id, outcome)
            });
        }

        let mut merged: Vec<SearchHit> = Vec::new();
        let mut answered: Vec<ShardId> = Vec::new();
        let mut degraded: Vec<ShardId> = Vec::new();

        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, tasks.join_next()).await {
                Ok(Some(Ok((shard_id, Ok(hits))))) => {
                    answered.push(shard_id);
                    merged.extend(hits);
                }
                Ok(Some(Ok((shard_id, Err(err))))) => {
                    warn!(shard = shard_id, error = %err, "shard dropped from query");
                    degraded.push(shard_id);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "query task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    // Query budget exhausted; everything still pending is
                    // degraded.
                    warn!(pending = tasks.len(), "query budget exhausted");
                    tasks.abort_all();
                    break;
                }
            }
        }
        // Shards that never reported (budget abort, panicked task) are
        // degraded too.
        for &shard_id in &targets {
            if !answered.contains(&shard_id) && !degraded.contains(&shard_id) {
                degraded.push(shard_id);
            }
        }
        degraded.sort_unstable();
        degraded.dedup();

        if degraded.len() >= targets.len() {
            return Err(StrataError::AllShardsUnavailable {
                total: targets.len(),
            });
        }

        rank_hits(&mut merged);
        merged.truncate(k);

        self.metrics.observe(
            names::QUERY_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.metrics
            .observe(names::QUERY_DEGRADED_SHARDS, degraded.len() as f64);
        debug!(
            targets = targets.len(),
            degraded = degraded.len(),
            hits = merged.len(),
            "query complete"
        );

        Ok(QueryResult {
            results: merged,
            degraded_shards: degraded,
        })
    }
}
