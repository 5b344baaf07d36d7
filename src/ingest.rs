//! Upload ingestion.
//!
//! The coordinator discovers pending uploads in object storage, downloads
//! and validates each manifest, dedups against the owner's shard, embeds
//! the content, and lands the record in the hot tier. A marker object
//! written under `ingested/` is the commit point: discovery skips any
//! upload whose marker exists, so re-processing after a crash is
//! duplicate-free.
//!
//! Uploads live at `uploads/<owner_key>/<upload_id>`; the upload id doubles
//! as the record id, which makes the whole pipeline idempotent per upload.
//!
//! Concurrency is a bounded worker pool. Uploads for the same owner key
//! are serialized through a per-owner lock so dedup reads never race a
//! concurrent insert for that owner. When the discovered backlog exceeds
//! the threshold, each worker holds twice the permits, halving effective
//! concurrency until the backlog drains.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, RetryPolicy, retry_with_backoff};
use crate::embedder::{Embedder, FALLBACK_METADATA_KEY, fallback_embedding};
use crate::error::{StrataError, StrataResult};
use crate::metrics::{MetricsSink, names};
use crate::object_store::ObjectStore;
use crate::routing::ShardRouter;
use crate::shard::Shard;
use crate::store::StorageTier;
use crate::types::{Record, Tier, TierMarker};
use crate::vector::{content_hash, fingerprint};

/// Ingestion configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Object-storage bucket holding uploads and markers
    pub bucket: String,

    /// Prefix pending uploads are listed under
    pub uploads_prefix: String,

    /// Prefix commit markers are written under
    pub ingested_prefix: String,

    /// Worker pool width
    pub max_concurrent: usize,

    /// Fingerprint hamming distance at or below which an upload is a
    /// near-duplicate
    pub near_dup_max_distance: u32,

    /// Backlog size above which concurrency is halved
    pub backlog_threshold: usize,

    /// How long shutdown waits for in-flight uploads
    pub drain_timeout: std::time::Duration,

    /// Retry policy for object-store and embedder calls
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket: "memory".to_string(),
            uploads_prefix: "uploads/".to_string(),
            ingested_prefix: "ingested/".to_string(),
            max_concurrent: 10,
            near_dup_max_distance: 3,
            backlog_threshold: 100,
            drain_timeout: std::time::Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// A pending upload found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    /// Upload id (also becomes the record id)
    pub upload_id: String,
    /// Owner key parsed from the object path
    pub owner_key: String,
    /// Full object path of the manifest
    pub location: String,
}

/// Dead letters kept in memory; older entries roll off.
const DEAD_LETTER_HISTORY: usize = 256;

/// What the uploader wrote: JSON at `uploads/<owner>/<id>`.
#[derive(Debug, Deserialize)]
struct UploadManifest {
    content: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// How one upload was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Landed in the hot tier
    Stored,
    /// Exact or near duplicate of an existing record
    Duplicate,
    /// Malformed manifest, dead-lettered
    Rejected,
}

/// An upload that could not be ingested and will not be retried.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// The failed upload
    pub upload_id: String,
    /// Why it failed
    pub reason: String,
    /// When it was dead-lettered
    pub at: DateTime<Utc>,
}

/// Tally of one ingestion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Records stored
    pub stored: usize,
    /// Duplicates skipped
    pub duplicates: usize,
    /// Manifests dead-lettered
    pub rejected: usize,
    /// Uploads that errored and remain pending
    pub errored: usize,
}

/// Drives uploads from object storage into the hot tier.
pub struct IngestionCoordinator {
    router: Arc<ShardRouter>,
    shards: Vec<Arc<Shard>>,
    object_store: Arc<dyn ObjectStore>,
    embedder: Arc<dyn Embedder>,
    store_breaker: Arc<CircuitBreaker>,
    embed_breaker: Arc<CircuitBreaker>,
    config: IngestConfig,
    metrics: Arc<dyn MetricsSink>,

    workers: Arc<Semaphore>,
    owner_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    backlog: AtomicUsize,
    inflight: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
}

impl IngestionCoordinator {
    /// Wire up a coordinator. Shards must be indexed by shard id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<ShardRouter>,
        shards: Vec<Arc<Shard>>,
        object_store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn Embedder>,
        store_breaker: Arc<CircuitBreaker>,
        embed_breaker: Arc<CircuitBreaker>,
        config: IngestConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent * 2));
        Self {
            router,
            shards,
            object_store,
            embedder,
            store_breaker,
            embed_breaker,
            config,
            metrics,
            workers,
            owner_locks: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::with_capacity(DEAD_LETTER_HISTORY)),
            backlog: AtomicUsize::new(0),
            inflight: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// List uploads that have no commit marker yet.
    ///
    /// Paths that don't parse as `uploads/<owner>/<id>` are dead-lettered
    /// here rather than surfacing on every cycle.
    pub async fn discover_uploads(&self) -> StrataResult<Vec<UploadDescriptor>> {
        let paths = retry_with_backoff(&self.store_breaker, &self.config.retry, || {
            self.object_store
                .list_prefixes(&self.config.bucket, &self.config.uploads_prefix)
        })
        .await?;

        let mut pending = Vec::new();
        for path in paths {
            let Some(descriptor) = self.parse_upload_path(&path) else {
                self.dead_letter(&path, "unparseable upload path");
                continue;
            };
            let marker = format!("{}{}", self.config.ingested_prefix, descriptor.upload_id);
            let done = retry_with_backoff(&self.store_breaker, &self.config.retry, || {
                self.object_store.exists(&self.config.bucket, &marker)
            })
            .await?;
            if !done {
                pending.push(descriptor);
            }
        }
        self.backlog.store(pending.len(), Ordering::SeqCst);
        Ok(pending)
    }

    /// Ingest a single upload end to end.
    ///
    /// Safe to call twice with the same descriptor: the second call dedups
    /// on content hash and resolves as [`IngestOutcome::Duplicate`].
    pub async fn process_upload(&self, descriptor: &UploadDescriptor) -> StrataResult<IngestOutcome> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(StrataError::Shutdown {
                reason: "ingestion draining".to_string(),
            });
        }
        let started = Instant::now();

        // Serialize per owner so dedup checks can't race an insert for
        // the same owner key.
        let owner_lock = self
            .owner_locks
            .entry(descriptor.owner_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _owner = owner_lock.lock().await;

        let bytes = retry_with_backoff(&self.store_breaker, &self.config.retry, || {
            self.object_store
                .download(&self.config.bucket, &descriptor.location)
        })
        .await?;

        let manifest: UploadManifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                self.dead_letter(&descriptor.upload_id, &format!("malformed manifest: {err}"));
                self.mark_ingested(&descriptor.upload_id, "rejected").await?;
                return Ok(IngestOutcome::Rejected);
            }
        };
        if manifest.content.trim().is_empty() {
            self.dead_letter(&descriptor.upload_id, "empty content");
            self.mark_ingested(&descriptor.upload_id, "rejected").await?;
            return Ok(IngestOutcome::Rejected);
        }

        let shard = self.shard_for(&descriptor.owner_key);

        // Exact dedup on content hash, then near-dedup on fingerprint.
        let hash = content_hash(&manifest.content);
        let is_duplicate = shard.hot.contains_content_hash(&hash)
            || shard
                .hot
                .nearest_fingerprint_distance(fingerprint(&manifest.content))
                .is_some_and(|d| d <= self.config.near_dup_max_distance);
        if is_duplicate {
            debug!(upload = %descriptor.upload_id, "duplicate upload skipped");
            self.metrics.incr_counter(names::INGEST_DUPLICATE, 1);
            self.mark_ingested(&descriptor.upload_id, "duplicate").await?;
            return Ok(IngestOutcome::Duplicate);
        }

        let (embedding, degraded) = self.embed_or_fallback(&manifest.content).await;
        let mut metadata = manifest.metadata;
        if degraded {
            metadata.insert(FALLBACK_METADATA_KEY.to_string(), "true".to_string());
        }

        let record = Record::new(
            descriptor.upload_id.clone(),
            descriptor.owner_key.clone(),
            manifest.content,
            embedding,
            manifest.timestamp.unwrap_or_else(Utc::now),
            metadata,
        );
        shard.hot.insert(record)?;
        shard.set_marker(
            descriptor.upload_id.clone(),
            TierMarker::Settled(Tier::Hot),
        );

        // Commit point. If this write fails the record is already stored;
        // the next cycle re-discovers the upload and dedups it.
        self.mark_ingested(&descriptor.upload_id, "stored").await?;

        self.metrics.incr_counter(names::INGEST_STORED, 1);
        self.metrics.observe(
            names::INGEST_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(IngestOutcome::Stored)
    }

    /// One full cycle: discover, then process everything through the
    /// worker pool. Takes the coordinator by `Arc` so workers can hold it
    /// across await points; callers keep their own clone.
    pub async fn run_once(self: Arc<Self>) -> StrataResult<IngestReport> {
        let pending = self.discover_uploads().await?;
        let backlog = pending.len();
        self.metrics.set_gauge(names::INGEST_BACKLOG, backlog as f64);
        if backlog == 0 {
            return Ok(IngestReport::default());
        }

        let throttled = backlog > self.config.backlog_threshold;
        if throttled {
            warn!(backlog, threshold = self.config.backlog_threshold, "ingest backlog high, throttling");
        }
        // The pool holds 2x permits; normal workers take two, throttled
        // workers take four, halving parallelism.
        let permits_per_task: u32 = if throttled { 4 } else { 2 };

        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;
        for descriptor in pending {
            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            dispatched += 1;
            let coordinator = Arc::clone(&self);
            let inflight = Arc::clone(&self.inflight);
            let permit = Arc::clone(&self.workers)
                .acquire_many_owned(permits_per_task)
                .await
                .map_err(|_| StrataError::Shutdown {
                    reason: "worker pool closed".to_string(),
                })?;
            inflight.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = coordinator.process_upload(&descriptor).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                (descriptor, outcome)
            });
        }

        let mut report = IngestReport::default();
        while let Some(joined) = tasks.join_next().await {
            let Ok((descriptor, outcome)) = joined else {
                report.errored += 1;
                continue;
            };
            match outcome {
                Ok(IngestOutcome::Stored) => report.stored += 1,
                Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
                Ok(IngestOutcome::Rejected) => report.rejected += 1,
                Err(err) => {
                    report.errored += 1;
                    warn!(upload = %descriptor.upload_id, error = %err, "upload ingestion failed, left pending");
                }
            }
        }

        // Evict owner locks nobody holds: every worker has joined, so any
        // lock with extra references belongs to a concurrent cycle.
        self.owner_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        // Uploads never dispatched (shutdown hit mid-loop) are still
        // pending, alongside the dispatched ones that errored.
        let residual = backlog - dispatched + report.errored;
        self.backlog.store(residual, Ordering::SeqCst);
        self.metrics.set_gauge(names::INGEST_BACKLOG, residual as f64);
        info!(
            stored = report.stored,
            duplicates = report.duplicates,
            rejected = report.rejected,
            errored = report.errored,
            "ingestion cycle complete"
        );
        Ok(report)
    }

    /// Stop accepting uploads, then wait for in-flight ones to finish.
    ///
    /// Returns `false` if the drain timeout elapsed with work still in
    /// flight.
    pub async fn shutdown(&self) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.drain_timeout;
        while self.inflight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    inflight = self.inflight.load(Ordering::SeqCst),
                    "ingestion drain timed out"
                );
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        true
    }

    /// Uploads left pending as of the last cycle.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Admission check for push-style submitters: refuse new work while
    /// the backlog is over threshold.
    pub fn check_capacity(&self) -> StrataResult<()> {
        let backlog = self.backlog();
        if backlog > self.config.backlog_threshold {
            return Err(StrataError::Capacity {
                backlog,
                threshold: self.config.backlog_threshold,
            });
        }
        Ok(())
    }

    /// The most recent permanently rejected uploads (metrics count all of
    /// them; the in-memory list keeps the last [`DEAD_LETTER_HISTORY`]).
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|letters| letters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether new uploads are currently refused.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn shard_for(&self, owner_key: &str) -> &Arc<Shard> {
        let shard_id = self.router.shard_for(owner_key) as usize;
        &self.shards[shard_id]
    }

    /// `uploads/<owner>/<id>` -> descriptor. Anything else is malformed.
    fn parse_upload_path(&self, path: &str) -> Option<UploadDescriptor> {
        let rest = path.strip_prefix(&self.config.uploads_prefix)?;
        let (owner_key, upload_id) = rest.split_once('/')?;
        if owner_key.is_empty() || upload_id.is_empty() || upload_id.contains('/') {
            return None;
        }
        Some(UploadDescriptor {
            upload_id: upload_id.to_string(),
            owner_key: owner_key.to_string(),
            location: path.to_string(),
        })
    }

    /// Write the commit marker for an upload.
    async fn mark_ingested(&self, upload_id: &str, resolution: &str) -> StrataResult<()> {
        let marker = format!("{}{}", self.config.ingested_prefix, upload_id);
        let body = serde_json::json!({
            "upload_id": upload_id,
            "resolution": resolution,
            "at": Utc::now(),
        });
        retry_with_backoff(&self.store_breaker, &self.config.retry, || {
            self.object_store.upload(
                &self.config.bucket,
                &marker,
                serde_json::to_vec(&body).unwrap_or_default(),
            )
        })
        .await
    }

    /// Embed through the breaker; fall back to a flagged placeholder if
    /// the embedder stays down.
    async fn embed_or_fallback(&self, content: &str) -> (crate::vector::Vector, bool) {
        let attempt = retry_with_backoff(&self.embed_breaker, &self.config.retry, || {
            self.embedder.embed(content)
        })
        .await;
        match attempt {
            Ok(vector) => (vector, false),
            Err(err) => {
                warn!(error = %err, "embedder unavailable, storing fallback embedding");
                (fallback_embedding(content, self.embedder.dimensions()), true)
            }
        }
    }

    fn dead_letter(&self, upload_id: &str, reason: &str) {
        warn!(upload = %upload_id, reason, "upload dead-lettered");
        self.metrics.incr_counter(names::INGEST_DEAD_LETTER, 1);
        if let Ok(mut letters) = self.dead_letters.lock() {
            if letters.len() == DEAD_LETTER_HISTORY {
                letters.pop_front();
            }
            letters.push_back(DeadLetter {
                upload_id: upload_id.to_string(),
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
    }
}
