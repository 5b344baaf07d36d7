//! Object-storage collaborator interface.
//!
//! Backend choice (S3, GCS, filesystem, ...) is out of scope; the engine
//! depends only on this trait and receives an implementation at
//! construction. [`MemoryObjectStore`] is the in-crate implementation used
//! by embedded deployments and tests, with injectable transient failures
//! so breaker and retry paths are exercisable.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{StrataError, StrataResult};

/// Minimal object-storage surface the engine needs.
///
/// All failures surfaced as [`StrataError::TransientIo`] are retried with
/// backoff through the object-store circuit breaker.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, overwriting any existing one.
    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>) -> StrataResult<()>;

    /// Fetch an object's bytes.
    async fn download(&self, bucket: &str, path: &str) -> StrataResult<Vec<u8>>;

    /// List object paths in a bucket under a prefix.
    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> StrataResult<Vec<String>>;

    /// Delete an object (idempotent; deleting a missing object is fine).
    async fn delete(&self, bucket: &str, path: &str) -> StrataResult<()>;

    /// Whether an object exists.
    async fn exists(&self, bucket: &str, path: &str) -> StrataResult<bool>;
}

/// In-memory object store.
///
/// Keys are `bucket/path`. `fail_next(n)` makes the next `n` operations
/// fail with a transient error, which is how tests drive the breaker
/// through its state machine without a network.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
    failures_remaining: AtomicU32,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail transiently.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn key(bucket: &str, path: &str) -> String {
        format!("{bucket}/{path}")
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
                dependency: "object_store".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>) -> StrataResult<()> {
        self.check_injected_failure()?;
        self.objects.insert(Self::key(bucket, path), data);
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> StrataResult<Vec<u8>> {
        self.check_injected_failure()?;
        self.objects
            .get(&Self::key(bucket, path))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StrataError::TransientIo {
                dependency: "object_store".to_string(),
                reason: format!("object '{bucket}/{path}' not found"),
            })
    }

    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> StrataResult<Vec<String>> {
        self.check_injected_failure()?;
        let bucket_prefix = format!("{bucket}/");
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .filter_map(|entry| {
                let key = entry.key();
                let path = key.strip_prefix(&bucket_prefix)?;
                path.starts_with(prefix).then(|| path.to_string())
            })
            .collect();
        // Deterministic discovery order regardless of map iteration.
        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, bucket: &str, path: &str) -> StrataResult<()> {
        self.check_injected_failure()?;
        self.objects.remove(&Self::key(bucket, path));
        Ok(())
    }

    async fn exists(&self, bucket: &str, path: &str) -> StrataResult<bool> {
        self.check_injected_failure()?;
        Ok(self.objects.contains_key(&Self::key(bucket, path)))
    }
}
