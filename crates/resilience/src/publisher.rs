//! The circuit-breaking publisher: one wrapper for every downstream call.
//!
//! [`CircuitBreakingPublisher::call`] applies breaker admission, bounded
//! retry with backoff, and breaker bookkeeping.
//! [`CircuitBreakingPublisher::call_with_fallback`] additionally serves a
//! cached value while the circuit is open, which the caller receives as
//! [`Guarded::Fallback`] rather than as an error.

use std::future::Future;
use std::sync::Arc;

use pipeline::{DependencyError, DependencyName};

use crate::{Admission, CircuitBreaker, FallbackCache, RetryConfig};

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    /// Fresh result from the dependency.
    Live(T),
    /// Served from the fallback cache because the circuit was open.
    Fallback(T),
}

impl<T> Guarded<T> {
    /// True for [`Guarded::Fallback`].
    pub fn is_fallback(&self) -> bool {
        matches!(self, Guarded::Fallback(_))
    }

    /// The value, live or not.
    pub fn into_inner(self) -> T {
        match self {
            Guarded::Live(v) | Guarded::Fallback(v) => v,
        }
    }
}

/// Retry and circuit policy for one dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakingPublisher {
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl CircuitBreakingPublisher {
    /// Wraps calls to the dependency protected by `breaker`.
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self { breaker, retry }
    }

    /// Dependency name.
    pub fn dependency(&self) -> &DependencyName {
        self.breaker.dependency()
    }

    /// Shared breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retry schedule.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Invokes `operation` (passed the 1-based attempt number) until it
    /// succeeds, fails permanently, the circuit opens, or the attempt budget
    /// is spent.
    ///
    /// # Errors
    ///
    /// - [`DependencyError::CircuitOpen`] when the breaker rejects an attempt.
    /// - [`DependencyError::Exhausted`] after `max_attempts` transient failures.
    /// - Any non-retryable error from `operation`, unchanged.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, DependencyError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if let Admission::Rejected { retry_after } = self.breaker.admit() {
                tracing::debug!(
                    dependency = %self.dependency(),
                    attempt,
                    "Call short-circuited by open breaker"
                );
                return Err(DependencyError::CircuitOpen {
                    dependency: self.dependency().clone(),
                    retry_after,
                });
            }

            match operation(attempt).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let policy = err.retry_policy();
                    if !policy.is_retryable() {
                        // The dependency answered; it is not down.
                        self.breaker.record_success();
                        return Err(err);
                    }
                    self.breaker.record_failure();
                    tracing::warn!(
                        dependency = %self.dependency(),
                        attempt,
                        max_attempts,
                        error = %err,
                        "Transient dependency failure"
                    );
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        let hint = match policy {
                            pipeline::RetryPolicy::Retryable { after } => after,
                            pipeline::RetryPolicy::NonRetryable => None,
                        };
                        let delay = self.retry.delay_for_attempt(attempt - 1, hint);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(DependencyError::Exhausted {
            dependency: self.dependency().clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Like [`call`](Self::call), but while the circuit is open serves the
    /// value `cache` holds for `key`. Live results are remembered in `cache`.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, except that `CircuitOpen` is
    /// only returned when the cache has nothing for `key`.
    pub async fn call_with_fallback<K, V, F, Fut>(
        &self,
        key: &K,
        cache: &dyn FallbackCache<K, V>,
        operation: F,
    ) -> Result<Guarded<V>, DependencyError>
    where
        K: Send + Sync,
        V: Send + Sync,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<V, DependencyError>>,
    {
        match self.call(operation).await {
            Ok(value) => {
                cache.remember(key, &value).await;
                Ok(Guarded::Live(value))
            }
            Err(DependencyError::CircuitOpen {
                dependency,
                retry_after,
            }) => match cache.lookup(key).await {
                Some(value) => {
                    tracing::info!(dependency = %dependency, "Serving fallback while circuit is open");
                    Ok(Guarded::Fallback(value))
                }
                None => Err(DependencyError::CircuitOpen {
                    dependency,
                    retry_after,
                }),
            },
            Err(other) => Err(other),
        }
    }
}
