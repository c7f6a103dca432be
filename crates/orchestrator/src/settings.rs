//! Tunables for the orchestrator and its components.
//!
//! Validation happens where configuration is loaded; these types only carry
//! values and their defaults.

use std::time::Duration;

use pipeline::{PolicyFailureMode, PolicyId, RiskScore};
use resilience::RetryConfig;

/// Step and run bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Upper bound on one attempt of one step.
    pub step_timeout: Duration,
    /// Upper bound on a whole run, retries included. Exceeding it fails the
    /// run and raises an alert.
    pub run_timeout: Duration,
    /// Attempts per step for retryable failures (storage conflicts, step
    /// timeouts).
    pub max_step_attempts: u32,
    /// Backoff between step attempts.
    pub step_retry: RetryConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(15 * 60),
            max_step_attempts: 3,
            step_retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: 0.1,
            },
        }
    }
}

/// Impact analysis bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    /// Time allowed for the whole analysis; partial results are kept when it
    /// runs out.
    pub timeout: Duration,
    /// Floor applied to the risk score of an incomplete analysis.
    pub default_risk_score: RiskScore,
    /// Resolve CODEOWNERS for the changed files.
    pub resolve_owners: bool,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            default_risk_score: RiskScore::clamped(50.0),
            resolve_owners: true,
        }
    }
}

/// Policy gate behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    /// What to decide when the engine is unreachable.
    pub failure_mode: PolicyFailureMode,
    /// Policy evaluated for pull requests that name none.
    pub default_policy: PolicyId,
}

impl GateSettings {
    /// Fail-closed gate with the given default policy.
    pub fn new(default_policy: PolicyId) -> Self {
        Self {
            failure_mode: PolicyFailureMode::FailClosed,
            default_policy,
        }
    }
}

impl Default for GateSettings {
    /// Fail-closed with the `default` policy.
    fn default() -> Self {
        Self::new(PolicyId::from_static("default"))
    }
}
