//! Embedding collaborator interface.
//!
//! Model inference is out of scope; the engine receives an [`Embedder`] at
//! construction. [`HashEmbedder`] is a deterministic, dependency-free
//! implementation: good enough for tests and for degraded-mode fallbacks,
//! never a substitute for a real model. Any fallback vector written into a
//! record is flagged in metadata under [`FALLBACK_METADATA_KEY`] so ranking
//! can never silently treat it as a real embedding.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{StrataError, StrataResult};
use crate::vector::Vector;

/// Metadata key flagging a degraded-mode placeholder embedding.
pub const FALLBACK_METADATA_KEY: &str = "embedding_fallback";

/// Embedding-model surface the engine needs.
///
/// Failures are retryable; calls go through the embedder circuit breaker.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> StrataResult<Vector>;

    /// Embed a batch of texts, preserving order.
    async fn batch_embed(&self, texts: &[String]) -> StrataResult<Vec<Vector>>;

    /// Embedding dimensionality. Must be nonzero; a zero-dimensional
    /// embedder cannot produce vectors at all.
    fn dimensions(&self) -> usize;
}

/// Deterministic content-derived embedder.
///
/// Spreads blake3 digests of whitespace tokens across the vector, so
/// similar texts land near each other while staying fully reproducible.
#[derive(Debug)]
pub struct HashEmbedder {
    dimensions: usize,
    failures_remaining: AtomicU32,
}

impl HashEmbedder {
    /// Create an embedder producing `dimensions`-length vectors.
    pub fn new(dimensions: usize) -> Self {
        assert!(dimensions > 0, "embedding dimensions must be positive");
        Self {
            dimensions,
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail transiently (for breaker tests).
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> StrataResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StrataError::TransientIo {
                dependency: "embedder".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn embed_sync(&self, text: &str) -> Vector {
        fallback_embedding(text, self.dimensions)
    }
}

/// Content-derived placeholder vector for degraded-mode ingestion.
///
/// Used when the real embedder stays unavailable after retries; records
/// carrying one are flagged via [`FALLBACK_METADATA_KEY`] so they can be
/// re-embedded later.
///
/// # Panics
///
/// Panics if `dimensions` is zero, like every other `Vector` constructor.
pub fn fallback_embedding(text: &str, dimensions: usize) -> Vector {
    assert!(dimensions > 0, "embedding dimensions must be positive");
    let mut data = vec![0.0f32; dimensions];
    for token in text.split_whitespace() {
        let digest = blake3::hash(token.as_bytes());
        let bytes = digest.as_bytes();
        let bucket =
            usize::from_le_bytes(bytes[..8].try_into().unwrap_or([0u8; 8])) % dimensions;
        let sign = if bytes[8] & 1 == 1 { 1.0 } else { -1.0 };
        data[bucket] += sign;
    }
    // All-zero (empty text) stays zero; cosine handles zero norms.
    Vector::new(data)
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> StrataResult<Vector> {
        self.check_injected_failure()?;
        Ok(self.embed_sync(text))
    }

    async fn batch_embed(&self, texts: &[String]) -> StrataResult<Vec<Vector>> {
        self.check_injected_failure()?;
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
