//! Tier aging and migration.
//!
//! The aging service is the only component allowed to change a record's
//! tier. Records age hot→warm once they fall outside the hot retention
//! window (optionally gated on low access count), and warm→cold after the
//! longer warm window.
//!
//! ## Migration protocol
//!
//! Per record, strictly ordered:
//!
//! 1. mark `Migrating` (source remains authoritative)
//! 2. transform for the target tier (quantize, or summarize for cold)
//! 3. write the transformed record into the target tier
//! 4. checksum the target copy as read back, and the equivalent
//!    projection of the source
//! 5. mismatch: drop the target copy, restore the marker, leave the
//!    source untouched, count the failure for the next pass
//! 6. match: only now delete from the source and settle the marker
//!
//! A crash between steps 3 and 6 leaves a `Migrating` marker behind;
//! [`AgingService::recover`] either finishes the commit (target verifies)
//! or discards the orphaned target copy. No interleaving ever leaves zero
//! copies, and no unverified copy is ever treated as authoritative.
//!
//! One migration pass runs per shard at a time (the shard's aging lock);
//! different shards migrate fully in parallel.

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{StrataError, StrataResult};
use crate::metrics::{MetricsSink, names};
use crate::shard::Shard;
use crate::store::{ColdRecord, StorageTier, StoredEntry, WarmRecord};
use crate::types::{RecordId, Tier, TierMarker};

/// Aging policy configuration.
#[derive(Debug, Clone)]
pub struct AgingConfig {
    /// Age after which hot records become warm candidates
    pub hot_retention: Duration,

    /// Age after which warm records become cold candidates
    pub warm_retention: Duration,

    /// When set, hot records are only demoted if read at most this many
    /// times (frequently-read records stay hot past the window)
    pub max_access_count: Option<u64>,

    /// Records migrated per batch per shard
    pub batch_size: usize,

    /// Per-record failures before an operator alert fires
    pub max_attempts: u32,

    /// Background pass interval
    pub pass_interval: std::time::Duration,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            hot_retention: Duration::days(7),
            warm_retention: Duration::days(30),
            max_access_count: None,
            batch_size: 256,
            max_attempts: 3,
            pass_interval: std::time::Duration::from_secs(300),
        }
    }
}

/// Outcome of a migration batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Records committed to the target tier
    pub moved: usize,
    /// Records whose migration was aborted this batch
    pub failed: usize,
    /// Approximate bytes written to the target tier
    pub bytes: usize,
}

impl MigrationStats {
    /// Fold another batch's stats into this one.
    pub fn merge(&mut self, other: MigrationStats) {
        self.moved += other.moved;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

/// Per-record status inside a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Selected, not yet copied
    Pending,
    /// Written to the target tier, unverified
    Copied,
    /// Checksums matched
    Verified,
    /// Source deleted, marker settled
    Committed,
    /// Aborted this batch
    Failed,
}

/// One record's progress through a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEntry {
    /// The record being migrated
    pub record_id: RecordId,
    /// Current status
    pub status: MigrationStatus,
    /// Target-copy checksum, once computed
    pub checksum: Option<u32>,
}

/// A batch migration between two tiers of one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Job id
    pub id: Uuid,
    /// Shard the job ran on
    pub shard: u32,
    /// Tier records were read from
    pub source_tier: Tier,
    /// Tier records were written to
    pub target_tier: Tier,
    /// Per-record progress
    pub entries: Vec<MigrationEntry>,
    /// When the job started
    pub started_at: DateTime<Utc>,
}

/// Jobs retained for inspection.
const JOB_HISTORY: usize = 16;

/// Moves records down the tiers with verified, atomic transitions.
pub struct AgingService {
    shards: Vec<Arc<Shard>>,
    config: AgingConfig,
    metrics: Arc<dyn MetricsSink>,

    /// Per-record failure counts across passes
    attempts: DashMap<RecordId, u32>,

    /// Recent jobs, newest first
    recent_jobs: Mutex<VecDeque<MigrationJob>>,

    /// Checksum fault injection for integrity-path tests
    #[doc(hidden)]
    pub corrupt_next: DashSet<RecordId>,

    shutdown: Arc<AtomicBool>,
}

impl AgingService {
    /// Create an aging service over a set of shards.
    pub fn new(shards: Vec<Arc<Shard>>, config: AgingConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            shards,
            config,
            metrics,
            attempts: DashMap::new(),
            recent_jobs: Mutex::new(VecDeque::with_capacity(JOB_HISTORY)),
            corrupt_next: DashSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Recently completed jobs, newest first.
    pub fn recent_jobs(&self) -> Vec<MigrationJob> {
        self.recent_jobs
            .lock()
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run one full pass: hot→warm then warm→cold on every shard, shards
    /// in parallel, one pass per shard at a time.
    pub async fn run_pass(&self) -> StrataResult<MigrationStats> {
        let started = Instant::now();
        let mut total = MigrationStats::default();

        // Warm→cold runs first so a record demoted from hot this pass
        // still spends a full pass in warm before going cold.
        let batches = futures::future::join_all(self.shards.iter().map(|shard| async {
            let mut stats = self.migrate_batch(shard, Tier::Warm, Tier::Cold).await?;
            stats.merge(self.migrate_batch(shard, Tier::Hot, Tier::Warm).await?);
            Ok::<_, StrataError>(stats)
        }))
        .await;

        for batch in batches {
            total.merge(batch?);
        }

        self.emit_tier_gauges();
        self.metrics.observe(
            names::MIGRATION_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        info!(
            moved = total.moved,
            failed = total.failed,
            bytes = total.bytes,
            "aging pass complete"
        );
        Ok(total)
    }

    /// Migrate one batch of policy-eligible records on one shard.
    ///
    /// Takes the shard's aging lock for the duration: one migration pass
    /// per shard at a time. Per-record failures never abort the batch.
    pub async fn migrate_batch(
        &self,
        shard: &Arc<Shard>,
        source_tier: Tier,
        target_tier: Tier,
    ) -> StrataResult<MigrationStats> {
        if source_tier.next() != Some(target_tier) {
            return Err(StrataError::Validation {
                reason: format!("no migration path {source_tier} -> {target_tier}"),
            });
        }

        let _pass = shard.aging_lock.lock().await;

        let candidates = self.select_candidates(shard, source_tier);
        if candidates.is_empty() {
            return Ok(MigrationStats::default());
        }

        let mut job = MigrationJob {
            id: Uuid::new_v4(),
            shard: shard.id(),
            source_tier,
            target_tier,
            entries: candidates
                .iter()
                .map(|id| MigrationEntry {
                    record_id: id.clone(),
                    status: MigrationStatus::Pending,
                    checksum: None,
                })
                .collect(),
            started_at: Utc::now(),
        };

        let mut stats = MigrationStats::default();
        for entry in &mut job.entries {
            // A shutdown request lets the in-flight record finish but
            // starts no further ones.
            if self.shutdown.load(Ordering::Relaxed)
                && entry.status == MigrationStatus::Pending
                && stats.moved + stats.failed > 0
            {
                break;
            }
            match self.migrate_record(shard, entry, source_tier, target_tier) {
                Ok(bytes) => {
                    stats.moved += 1;
                    stats.bytes += bytes;
                    self.attempts.remove(&entry.record_id);
                }
                Err(err) => {
                    stats.failed += 1;
                    self.note_failure(&entry.record_id, &err);
                }
            }
        }

        debug!(
            shard = shard.id(),
            source = %source_tier,
            target = %target_tier,
            moved = stats.moved,
            failed = stats.failed,
            "migration batch finished"
        );
        self.metrics.incr_counter(names::MIGRATION_MOVED, stats.moved as u64);
        self.metrics.incr_counter(names::MIGRATION_FAILED, stats.failed as u64);
        self.push_job(job);
        Ok(stats)
    }

    /// Crash recovery for one shard: settle every `Migrating` marker.
    ///
    /// A verified target copy means the crash happened after verification;
    /// finish the commit. Anything else means the target copy (if any) is
    /// unverified; discard it and the source remains authoritative.
    pub async fn recover(&self, shard: &Arc<Shard>) -> StrataResult<usize> {
        let _pass = shard.aging_lock.lock().await;

        let mut settled = 0;
        for (id, from, to) in shard.migrating_ids() {
            let resolution = self.resolve_interrupted(shard, &id, from, to);
            trace!(shard = shard.id(), record = %id, ?resolution, "recovered migration");
            settled += 1;

            debug_assert!(
                !shard.tiers_holding(&id).is_empty(),
                "recovery must never leave zero copies"
            );
        }

        if settled > 0 {
            info!(shard = shard.id(), settled, "migration recovery complete");
        }
        Ok(settled)
    }

    /// Background loop: one pass per interval until shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let interval_duration = self.config.pass_interval;
        let service = self;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_duration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = service.run_pass().await {
                    warn!(error = %err, "aging pass failed");
                }
            }
        })
    }

    /// Request shutdown: the in-progress record finishes, no new batch
    /// starts.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Candidates meeting the aging policy, oldest-id-stable and bounded
    /// by batch size. Records already mid-migration are skipped.
    fn select_candidates(&self, shard: &Shard, source_tier: Tier) -> Vec<RecordId> {
        let now = Utc::now();
        let mut ids = match source_tier {
            Tier::Hot => {
                let cutoff = now - self.config.hot_retention;
                let mut ids = shard.hot.ids_older_than(cutoff);
                if let Some(gate) = self.config.max_access_count {
                    ids.retain(|id| shard.hot.access_count(id) <= gate);
                }
                ids
            }
            Tier::Warm => shard.warm.ids_older_than(now - self.config.warm_retention),
            Tier::Cold => Vec::new(),
        };

        ids.retain(|id| {
            !matches!(shard.marker(id), Some(TierMarker::Migrating { .. }))
        });
        ids.truncate(self.config.batch_size);
        ids
    }

    /// Steps 1-6 for a single record. Returns bytes written on commit.
    fn migrate_record(
        &self,
        shard: &Shard,
        entry: &mut MigrationEntry,
        source_tier: Tier,
        target_tier: Tier,
    ) -> StrataResult<usize> {
        let id = entry.record_id.clone();

        // Step 1: mark migrating; source stays authoritative.
        shard.set_marker(
            id.clone(),
            TierMarker::Migrating {
                from: source_tier,
                to: target_tier,
            },
        );

        let outcome = match (source_tier, target_tier) {
            (Tier::Hot, Tier::Warm) => self.copy_hot_to_warm(shard, &id),
            (Tier::Warm, Tier::Cold) => self.copy_warm_to_cold(shard, &id),
            _ => Err(StrataError::Validation {
                reason: format!("no migration path {source_tier} -> {target_tier}"),
            }),
        };

        match outcome {
            Ok((checksum, bytes)) => {
                entry.status = MigrationStatus::Verified;
                entry.checksum = Some(checksum);

                // Step 6: delete from source only after verification.
                match source_tier {
                    Tier::Hot => shard.hot.delete(&id),
                    Tier::Warm => shard.warm.delete(&id),
                    Tier::Cold => false,
                };
                shard.set_marker(id, TierMarker::Settled(target_tier));
                entry.status = MigrationStatus::Committed;
                Ok(bytes)
            }
            Err(err) => {
                // Step 5: abort this record only; source untouched.
                match target_tier {
                    Tier::Warm => shard.warm.delete(&id),
                    Tier::Cold => shard.cold.delete(&id),
                    Tier::Hot => false,
                };
                shard.set_marker(id, TierMarker::Settled(source_tier));
                entry.status = MigrationStatus::Failed;
                Err(err)
            }
        }
    }

    /// Steps 2-4 for hot→warm. Returns (verified checksum, bytes written).
    fn copy_hot_to_warm(&self, shard: &Shard, id: &RecordId) -> StrataResult<(u32, usize)> {
        let source = shard.hot.peek(id).ok_or_else(|| StrataError::NotFound {
            id: id.clone(),
            shard: shard.id(),
        })?;

        // Step 2: transform. Step 3: write and read back.
        let transformed = WarmRecord::from_hot(&source);
        shard.warm.insert(transformed)?;
        let written = shard.warm.get(id).ok_or_else(|| StrataError::Integrity {
            id: id.clone(),
            source_tier: Tier::Hot.to_string(),
            target_tier: Tier::Warm.to_string(),
        })?;

        // Step 4: compare checksums.
        let target_checksum = self.target_checksum(id, written.checksum_fields().checksum());
        let source_checksum = source.checksum_fields().checksum();
        if target_checksum != source_checksum {
            return Err(StrataError::Integrity {
                id: id.clone(),
                source_tier: Tier::Hot.to_string(),
                target_tier: Tier::Warm.to_string(),
            });
        }
        Ok((target_checksum, written.approx_bytes()))
    }

    /// Steps 2-4 for warm→cold.
    fn copy_warm_to_cold(&self, shard: &Shard, id: &RecordId) -> StrataResult<(u32, usize)> {
        let source = shard.warm.get(id).ok_or_else(|| StrataError::NotFound {
            id: id.clone(),
            shard: shard.id(),
        })?;

        let transformed = ColdRecord::from_warm(&source);
        shard.cold.insert(transformed)?;
        let written = shard.cold.get(id).ok_or_else(|| StrataError::Integrity {
            id: id.clone(),
            source_tier: Tier::Warm.to_string(),
            target_tier: Tier::Cold.to_string(),
        })?;

        let target_checksum = self.target_checksum(id, written.checksum_fields().checksum());
        let source_checksum = source.checksum_fields().checksum();
        if target_checksum != source_checksum {
            return Err(StrataError::Integrity {
                id: id.clone(),
                source_tier: Tier::Warm.to_string(),
                target_tier: Tier::Cold.to_string(),
            });
        }
        Ok((target_checksum, written.approx_bytes()))
    }

    /// Apply checksum fault injection, if armed for this record.
    fn target_checksum(&self, id: &RecordId, computed: u32) -> u32 {
        if self.corrupt_next.remove(id).is_some() {
            computed.wrapping_add(1)
        } else {
            computed
        }
    }

    /// Settle one interrupted migration. Returns the tier that ended up
    /// authoritative.
    fn resolve_interrupted(&self, shard: &Shard, id: &RecordId, from: Tier, to: Tier) -> Tier {
        let source_checksum = match from {
            Tier::Hot => shard.hot.peek(id).map(|r| r.checksum_fields().checksum()),
            Tier::Warm => shard.warm.get(id).map(|r| r.checksum_fields().checksum()),
            Tier::Cold => None,
        };
        let target_checksum = match to {
            Tier::Warm => shard.warm.get(id).map(|r| r.checksum_fields().checksum()),
            Tier::Cold => shard.cold.get(id).map(|r| r.checksum_fields().checksum()),
            Tier::Hot => None,
        };

        match (source_checksum, target_checksum) {
            // Crash after source delete: the target copy had verified.
            (None, Some(_)) => {
                shard.set_marker(id.clone(), TierMarker::Settled(to));
                to
            }
            // Both present and matching: finish the commit.
            (Some(source), Some(target)) if source == target => {
                match from {
                    Tier::Hot => shard.hot.delete(id),
                    Tier::Warm => shard.warm.delete(id),
                    Tier::Cold => false,
                };
                shard.set_marker(id.clone(), TierMarker::Settled(to));
                to
            }
            // Unverified or divergent target: discard it, source wins.
            (Some(_), _) => {
                match to {
                    Tier::Warm => shard.warm.delete(id),
                    Tier::Cold => shard.cold.delete(id),
                    Tier::Hot => false,
                };
                shard.set_marker(id.clone(), TierMarker::Settled(from));
                from
            }
            // Neither copy: unreachable by protocol order (source is
            // deleted only after the target verified). Settle on the
            // target so the marker doesn't wedge.
            (None, None) => {
                warn!(record = %id, "migrating marker with no copies");
                shard.set_marker(id.clone(), TierMarker::Settled(to));
                to
            }
        }
    }

    fn note_failure(&self, id: &RecordId, err: &StrataError) {
        let attempts = {
            let mut count = self.attempts.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempts >= self.config.max_attempts {
            warn!(
                record = %id,
                attempts,
                error = %err,
                "record failed migration beyond attempt cap"
            );
            self.metrics.incr_counter(names::MIGRATION_ALERT, 1);
        } else {
            debug!(record = %id, attempts, error = %err, "migration failed, will retry next pass");
        }
    }

    fn push_job(&self, job: MigrationJob) {
        if let Ok(mut jobs) = self.recent_jobs.lock() {
            if jobs.len() == JOB_HISTORY {
                jobs.pop_back();
            }
            jobs.push_front(job);
        }
    }

    fn emit_tier_gauges(&self) {
        let mut hot = 0usize;
        let mut warm = 0usize;
        let mut cold = 0usize;
        for shard in &self.shards {
            let health = shard.health();
            hot += health.hot;
            warm += health.warm;
            cold += health.cold;
        }
        let prefix = names::TIER_RECORDS_PREFIX;
        self.metrics.set_gauge(&format!("{prefix}.hot"), hot as f64);
        self.metrics.set_gauge(&format!("{prefix}.warm"), warm as f64);
        self.metrics.set_gauge(&format!("{prefix}.cold"), cold as f64);
    }
}
