/// Error types for strata operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the engine. All errors are well-typed and can be pattern-matched for
/// precise handling; recoverable conditions (retryable I/O, per-record
/// integrity failures) are distinct variants so callers can decide between
/// retry, skip, and propagate.
use thiserror::Error;

/// The main error type for strata operations.
///
/// All fallible operations return `Result<T, StrataError>` via the
/// [`StrataResult`] alias.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Record not found in any tier of the owning shard
    #[error("Record '{id}' not found in shard {shard}")]
    NotFound {
        /// The record id that was queried
        id: String,
        /// The shard that was queried
        shard: u32,
    },

    /// Transient I/O failure against a collaborator (retryable)
    #[error("Transient I/O failure against '{dependency}': {reason}")]
    TransientIo {
        /// Which collaborator failed (e.g. "object_store", "embedder")
        dependency: String,
        /// What went wrong
        reason: String,
    },

    /// Malformed manifest or record (dead-lettered, never retried)
    #[error("Validation failed: {reason}")]
    Validation {
        /// Why the input was rejected
        reason: String,
    },

    /// Checksum mismatch during a tier migration (record retried next pass)
    #[error("Integrity check failed for record '{id}' migrating {source_tier} -> {target_tier}")]
    Integrity {
        /// The record whose migration was aborted
        id: String,
        /// Source tier name
        source_tier: String,
        /// Target tier name
        target_tier: String,
    },

    /// Ingestion backlog over threshold (throttling signal, not a failure)
    #[error("Capacity: backlog {backlog} exceeds threshold {threshold}")]
    Capacity {
        /// Current backlog size
        backlog: usize,
        /// Configured threshold
        threshold: usize,
    },

    /// Circuit breaker is open; the dependency was not invoked
    #[error("Dependency '{dependency}' unavailable (circuit open)")]
    DependencyUnavailable {
        /// Which collaborator the breaker protects
        dependency: String,
    },

    /// Every targeted shard failed or timed out during a fan-out query.
    ///
    /// Distinct from an empty success: "no matches" and "nothing was
    /// reachable" must never be confused.
    #[error("All {total} targeted shards unavailable")]
    AllShardsUnavailable {
        /// Number of shards that were targeted
        total: usize,
    },

    /// Operation not supported by this tier (e.g. similarity search on cold)
    #[error("Operation '{operation}' not supported by the {tier} tier")]
    Unsupported {
        /// The operation that was attempted
        operation: String,
        /// The tier that rejected it
        tier: String,
    },

    /// Serialization error when encoding/decoding manifests or metadata
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine is shutting down; no new work is accepted
    #[error("Shutting down: {reason}")]
    Shutdown {
        /// Which subsystem refused the work
        reason: String,
    },
}

impl StrataError {
    /// Whether this error is safe to retry with backoff.
    ///
    /// Only transient collaborator failures qualify. Validation errors are
    /// dead-lettered, integrity errors are retried on the *next migration
    /// pass* (not inline), and open-circuit errors must wait for recovery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::TransientIo { .. })
    }
}

/// Result type alias for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;
