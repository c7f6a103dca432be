//! Error taxonomy and retry-policy types for the ingestion domain.
//!
//! [`PipelineError`] covers conditions that end or escalate a single pipeline
//! run. Component-level errors ([`StorageError`], [`DependencyError`],
//! [`MalformedEvent`]) are folded into it by the orchestrator.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].
//!
//! Two outcomes that look like failures are deliberately *not* errors here:
//! duplicate deliveries are an intake outcome, and a fallback served while a
//! circuit is open is a degraded success.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DependencyName;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the orchestrator and the
/// circuit-breaking publisher decide whether to re-invoke an operation
/// without escalating.
///
/// - `Retryable`: timeouts, connection failures, 5xx / 429 responses,
///   storage busy / write conflicts.
/// - `NonRetryable`: malformed input, 4xx responses, corrupted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried; escalation is required.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Intake errors
// ---------------------------------------------------------------------------

/// A raw event is missing a required field or carries an invalid value.
///
/// Permanent: never retried. The delivery is logged with its payload for
/// manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Malformed event: field '{field}' {reason}")]
pub struct MalformedEvent {
    /// Dotted path of the offending field (e.g. `"pull_request.number"`).
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl MalformedEvent {
    /// A required field is absent or null.
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: "is required".to_string(),
        }
    }

    /// A field is present but its value cannot be used.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Failures of the durable stores (delivery ledger, run store, graph store).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The store could not be reached or the operation failed transiently.
    ///
    /// For the delivery ledger this means the caller must not proceed and
    /// relies on upstream redelivery.
    #[error("Storage unavailable during {operation}: {message}")]
    Unavailable {
        /// Operation that failed (e.g. `"register delivery"`).
        operation: String,
        /// Underlying error text.
        message: String,
    },

    /// A concurrent writer holds the row/table lock. Resolved by retrying; the
    /// upsert policy is last-writer-wins.
    #[error("Write conflict during {operation}: {message}")]
    Conflict {
        /// Operation that conflicted.
        operation: String,
        /// Underlying error text.
        message: String,
    },

    /// Persisted state could not be decoded.
    #[error("Corrupt {what} in storage")]
    Corruption {
        /// What failed to decode (e.g. `"run checkpoint JSON"`).
        what: String,
    },

    /// Schema initialisation or migration failed. Fatal at startup.
    #[error("Schema error: {message}")]
    Schema {
        /// Description of the schema problem.
        message: String,
    },

    /// A graph write referenced an entity that is neither in the batch nor
    /// in the store.
    #[error("Dangling reference: {message}")]
    DanglingReference {
        /// Description of the unresolved reference.
        message: String,
    },
}

impl StorageError {
    /// Shorthand for [`StorageError::Unavailable`].
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`StorageError::Conflict`].
    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`StorageError::Corruption`].
    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }

    /// Retry classification.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StorageError::Unavailable { .. } | StorageError::Conflict { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            StorageError::Corruption { .. }
            | StorageError::Schema { .. }
            | StorageError::DanglingReference { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream dependency errors
// ---------------------------------------------------------------------------

/// Failures calling an external or downstream service (policy engine,
/// documentation portal, coverage service, graph query API, risk scorer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// The call failed in a way that may succeed on retry.
    #[error("Transient failure from {dependency}: {message}")]
    Transient {
        /// Dependency that failed.
        dependency: DependencyName,
        /// Underlying error text.
        message: String,
        /// Server-requested delay, if any.
        retry_after: Option<Duration>,
    },

    /// The call failed in a way that will not succeed on retry.
    #[error("Permanent failure from {dependency}: {message}")]
    Permanent {
        /// Dependency that failed.
        dependency: DependencyName,
        /// Underlying error text.
        message: String,
    },

    /// The dependency's circuit is open and no fallback value was available.
    #[error("Circuit open for {dependency}; retry after {retry_after:?}")]
    CircuitOpen {
        /// Dependency whose breaker is open.
        dependency: DependencyName,
        /// Remaining cool-down.
        retry_after: Duration,
    },

    /// The bounded retry budget was spent; the transient failure is now
    /// permanent for this run.
    #[error("{dependency} still failing after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Dependency that failed.
        dependency: DependencyName,
        /// Attempts made.
        attempts: u32,
        /// Text of the final failure.
        last_error: String,
    },
}

impl DependencyError {
    /// Shorthand for [`DependencyError::Transient`] without a server delay.
    pub fn transient(dependency: &DependencyName, message: impl Into<String>) -> Self {
        Self::Transient {
            dependency: dependency.clone(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Shorthand for [`DependencyError::Permanent`].
    pub fn permanent(dependency: &DependencyName, message: impl Into<String>) -> Self {
        Self::Permanent {
            dependency: dependency.clone(),
            message: message.into(),
        }
    }

    /// The dependency this error is attributed to.
    pub fn dependency(&self) -> &DependencyName {
        match self {
            DependencyError::Transient { dependency, .. }
            | DependencyError::Permanent { dependency, .. }
            | DependencyError::CircuitOpen { dependency, .. }
            | DependencyError::Exhausted { dependency, .. } => dependency,
        }
    }

    /// Retry classification for a single attempt.
    ///
    /// `CircuitOpen` and `Exhausted` are already the product of the retry
    /// machinery and are never retried again by it.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            DependencyError::Transient { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            DependencyError::Permanent { .. }
            | DependencyError::CircuitOpen { .. }
            | DependencyError::Exhausted { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Run-level errors
// ---------------------------------------------------------------------------

/// Errors that end or escalate a single pipeline run.
///
/// Per-event failures are isolated to their run; only storage/schema
/// initialisation at startup is fatal to the process.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The event could not be normalised into a fact bundle.
    #[error(transparent)]
    MalformedEvent(#[from] MalformedEvent),

    /// A durable store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A downstream dependency failed beyond what retry and fallback absorb.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// A single step exceeded its time bound.
    #[error("Step '{step}' timed out after {elapsed:?}")]
    StepTimeout {
        /// Step name.
        step: String,
        /// Time allowed.
        elapsed: Duration,
    },

    /// The run as a whole exceeded its time bound. Terminal and alerted.
    #[error("Run exceeded its {limit:?} time limit")]
    RunTimeout {
        /// Configured run-level limit.
        limit: Duration,
    },

    /// The run was superseded by a newer event for the same key.
    #[error("Run cancelled: superseded by delivery {superseded_by}")]
    Cancelled {
        /// Delivery whose run supersedes this one.
        superseded_by: String,
    },

    /// Configuration is invalid. Produced at load time; the process never
    /// starts with an invalid configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl PipelineError {
    /// Retry classification used by the step executor.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            PipelineError::Storage(e) => e.retry_policy(),
            PipelineError::Dependency(e) => e.retry_policy(),
            PipelineError::StepTimeout { .. } => RetryPolicy::Retryable { after: None },
            PipelineError::MalformedEvent(_)
            | PipelineError::RunTimeout { .. }
            | PipelineError::Cancelled { .. }
            | PipelineError::Configuration { .. } => RetryPolicy::NonRetryable,
        }
    }
}
