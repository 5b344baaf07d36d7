//! Circuit breaking and retry for external collaborators.
//!
//! Every call the engine makes to the object store or the embedder goes
//! through a [`CircuitBreaker`]: once a dependency is observed unhealthy,
//! further calls fail fast instead of stacking up timeouts. One breaker
//! instance exists per dependency and is shared by all call sites, so the
//! state and counters are lock-protected.
//!
//! ## State machine
//!
//! ```text
//! CLOSED --(failure_threshold failures in window)--> OPEN
//! OPEN   --(recovery_timeout elapsed)-------------> HALF_OPEN
//! HALF_OPEN --(success_threshold successes)-------> CLOSED
//! HALF_OPEN --(any failure)-----------------------> OPEN
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{StrataError, StrataResult};
use crate::metrics::{MetricsSink, names};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy; calls pass through
    Closed,
    /// Unhealthy; calls fail fast without invoking the dependency
    Open,
    /// Probing; trial calls pass through
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the breaker-state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` before the circuit opens
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted
    pub failure_window: Duration,
    /// Time the circuit stays open before probing
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Mutable breaker state, guarded by one mutex.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Timestamps of recent failures (pruned to the rolling window)
    failures: VecDeque<Instant>,
    /// Consecutive successes while half-open
    half_open_successes: u32,
    /// When the current state was entered
    last_transition: Instant,
}

/// A protective wrapper around calls to one external dependency.
pub struct CircuitBreaker {
    /// Dependency name, used in errors, logs, and gauges
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker for the named dependency.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                last_transition: Instant::now(),
            }),
            metrics,
        }
    }

    /// The dependency this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (open circuits may flip to half-open on read once the
    /// recovery timeout has elapsed).
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_probe(&mut inner);
        inner.state
    }

    /// Run a dependency call through the breaker.
    ///
    /// When the circuit is open the future is never polled; the call fails
    /// fast with [`StrataError::DependencyUnavailable`]. Only retryable
    /// (transient) errors count as dependency failures; a validation error
    /// passing through says nothing about the dependency's health.
    pub async fn call<T, F>(&self, fut: F) -> StrataResult<T>
    where
        F: Future<Output = StrataResult<T>>,
    {
        self.admit()?;

        match fut.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) if err.is_retryable() => {
                self.on_failure();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Administrative reset back to closed, clearing all counters.
    pub fn force_reset(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.half_open_successes = 0;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Check admission, transitioning open -> half-open when due.
    fn admit(&self) -> StrataResult<()> {
        let mut inner = self.lock();
        self.maybe_probe(&mut inner);
        match inner.state {
            CircuitState::Open => Err(StrataError::DependencyUnavailable {
                dependency: self.name.clone(),
            }),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                // Successes age failures out implicitly via the window.
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                // One failed trial re-opens immediately.
                inner.half_open_successes = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                let now = Instant::now();
                inner.failures.push_back(now);
                let window = self.config.failure_window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|&t| now.duration_since(t) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Open -> half-open once the recovery timeout has elapsed.
    fn maybe_probe(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= self.config.recovery_timeout
        {
            inner.half_open_successes = 0;
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        match next {
            CircuitState::Open => warn!(dependency = %self.name, "circuit opened"),
            CircuitState::HalfOpen => debug!(dependency = %self.name, "circuit probing"),
            CircuitState::Closed => debug!(dependency = %self.name, "circuit closed"),
        }
        inner.state = next;
        inner.last_transition = Instant::now();
        self.metrics.set_gauge(
            &format!("{}.{}", names::BREAKER_STATE_PREFIX, self.name),
            next.as_gauge(),
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker mutex means a panic mid-transition; the state
        // itself is still a valid enum, so continue with it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bounded exponential backoff policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap on the per-attempt delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Retry a breaker-guarded call with bounded exponential backoff + jitter.
///
/// Only transient errors are retried; everything else (validation errors,
/// an open circuit) propagates immediately. The final transient error is
/// returned once attempts are exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> StrataResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StrataResult<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match breaker.call(op()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 2);
                let pause = (delay + Duration::from_millis(jitter_ms)).min(policy.max_delay);
                debug!(
                    dependency = breaker.name(),
                    attempt,
                    pause_ms = pause.as_millis() as u64,
                    "transient failure, backing off"
                );
                tokio::time::sleep(pause).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test_dep", config, Arc::new(NoopMetrics))
    }

    fn transient() -> StrataError {
        StrataError::TransientIo {
            dependency: "test_dep".to_string(),
            reason: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_opens_on_fifth_consecutive_failure() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });

        for i in 0..5 {
            assert_eq!(cb.state(), CircuitState::Closed, "closed before failure {i}");
            let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_invoking() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(3600),
            ..Default::default()
        });
        let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StrataError>(42)
            })
            .await;

        assert!(matches!(
            result,
            Err(StrataError::DependencyUnavailable { .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_then_closes() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            success_threshold: 2,
            ..Default::default()
        });
        let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.call(async { Ok::<_, StrataError>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.call(async { Ok::<_, StrataError>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip_breaker() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let _ = cb
            .call(async {
                Err::<(), _>(StrataError::Validation {
                    reason: "bad manifest".to_string(),
                })
            })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_reset_closes() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(3600),
            ..Default::default()
        });
        let _ = cb.call(async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.force_reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 10,
            ..Default::default()
        });
        let attempts = AtomicU32::new(0);

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result = retry_with_backoff(&cb, &policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        });
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result: StrataResult<()> = retry_with_backoff(&cb, &policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(matches!(result, Err(StrataError::TransientIo { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_validation() {
        let cb = breaker(CircuitBreakerConfig::default());
        let attempts = AtomicU32::new(0);
        let result: StrataResult<()> =
            retry_with_backoff(&cb, &RetryPolicy::default(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StrataError::Validation {
                        reason: "nope".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StrataError::Validation { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
