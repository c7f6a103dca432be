//! Policy types and the [`PolicyEngine`] port.
//!
//! The engine is an external decision function. This module owns the
//! interpretation of its verdicts and the named behaviour when it is
//! unavailable ([`PolicyFailureMode`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    DependencyError, EvaluationResult, FactBundle, PolicyId, RiskScore, SizeCategory,
};

/// Reason recorded for every decision made without the engine.
pub const POLICY_ENGINE_UNAVAILABLE: &str = "policy engine unavailable";

/// Behaviour when the policy engine cannot be reached (circuit open or
/// retries exhausted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFailureMode {
    /// Deny with reason [`POLICY_ENGINE_UNAVAILABLE`].
    #[default]
    FailClosed,
    /// Allow, flagged for audit.
    FailOpen,
}

/// Input sent to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    /// Normalised event facts.
    pub facts: FactBundle,
    /// Policies to evaluate.
    pub policies: Vec<PolicyId>,
    /// Risk score from impact analysis.
    pub risk_score: RiskScore,
    /// Size bucket from impact analysis.
    pub size_category: SizeCategory,
    /// Whether the analysis was partial.
    pub analysis_incomplete: bool,
}

/// The engine's answer for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    /// Evaluated policy.
    pub policy_id: PolicyId,
    /// Allow or deny.
    pub result: EvaluationResult,
    /// Human-readable reason.
    pub reason: String,
}

/// Everything the engine returned for one input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// One entry per evaluated policy.
    pub results: Vec<PolicyResult>,
}

/// Aggregate gate decision for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Deny if any policy denied.
    pub outcome: EvaluationResult,
    /// Reasons behind the outcome.
    pub reasons: Vec<String>,
    /// Per-policy results, as recorded in the graph.
    pub results: Vec<PolicyResult>,
    /// Produced without the engine.
    pub fallback: bool,
    /// Produced by [`PolicyFailureMode::FailOpen`]; needs operator review.
    pub audit_fail_open: bool,
}

impl Decision {
    /// Interprets an engine verdict for the requested policies.
    ///
    /// A requested policy missing from the verdict counts as a deny.
    pub fn from_verdict(requested: &[PolicyId], verdict: Verdict) -> Self {
        let mut results = verdict.results;
        for policy in requested {
            if !results.iter().any(|r| &r.policy_id == policy) {
                results.push(PolicyResult {
                    policy_id: policy.clone(),
                    result: EvaluationResult::Deny,
                    reason: "no verdict returned for policy".to_string(),
                });
            }
        }

        let denied: Vec<String> = results
            .iter()
            .filter(|r| r.result == EvaluationResult::Deny)
            .map(|r| format!("{}: {}", r.policy_id, r.reason))
            .collect();

        let (outcome, reasons) = if denied.is_empty() {
            let reasons = results
                .iter()
                .map(|r| format!("{}: {}", r.policy_id, r.reason))
                .collect();
            (EvaluationResult::Allow, reasons)
        } else {
            (EvaluationResult::Deny, denied)
        };

        Self {
            outcome,
            reasons,
            results,
            fallback: false,
            audit_fail_open: false,
        }
    }

    /// Decision used when the engine is unavailable.
    pub fn unavailable(mode: PolicyFailureMode, requested: &[PolicyId]) -> Self {
        let (outcome, reason, audit_fail_open) = match mode {
            PolicyFailureMode::FailClosed => (
                EvaluationResult::Deny,
                POLICY_ENGINE_UNAVAILABLE.to_string(),
                false,
            ),
            PolicyFailureMode::FailOpen => (
                EvaluationResult::Allow,
                format!("{POLICY_ENGINE_UNAVAILABLE} (fail-open, audit)"),
                true,
            ),
        };
        let results = requested
            .iter()
            .map(|policy_id| PolicyResult {
                policy_id: policy_id.clone(),
                result: outcome,
                reason: reason.clone(),
            })
            .collect();
        Self {
            outcome,
            reasons: vec![reason],
            results,
            fallback: true,
            audit_fail_open,
        }
    }
}

/// External decision function.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluates the input against the requested policies.
    async fn evaluate(&self, input: &PolicyInput) -> Result<Verdict, DependencyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: &str) -> PolicyId {
        PolicyId::new(id).unwrap()
    }

    #[test]
    fn fail_closed_is_the_default_and_denies() {
        assert_eq!(PolicyFailureMode::default(), PolicyFailureMode::FailClosed);
        let decision = Decision::unavailable(PolicyFailureMode::default(), &[policy("p1")]);
        assert_eq!(decision.outcome, EvaluationResult::Deny);
        assert_eq!(decision.reasons, vec![POLICY_ENGINE_UNAVAILABLE.to_string()]);
        assert_eq!(decision.results[0].reason, POLICY_ENGINE_UNAVAILABLE);
        assert!(decision.fallback);
        assert!(!decision.audit_fail_open);
    }

    #[test]
    fn fail_open_allows_with_audit_flag() {
        let decision = Decision::unavailable(PolicyFailureMode::FailOpen, &[policy("p1")]);
        assert_eq!(decision.outcome, EvaluationResult::Allow);
        assert!(decision.audit_fail_open);
        assert!(decision.reasons[0].starts_with(POLICY_ENGINE_UNAVAILABLE));
    }

    #[test]
    fn any_deny_denies_and_missing_policies_deny() {
        let verdict = Verdict {
            results: vec![PolicyResult {
                policy_id: policy("p1"),
                result: EvaluationResult::Allow,
                reason: "ok".into(),
            }],
        };
        let decision = Decision::from_verdict(&[policy("p1"), policy("p2")], verdict);
        assert_eq!(decision.outcome, EvaluationResult::Deny);
        assert_eq!(decision.results.len(), 2);
        assert_eq!(decision.reasons, vec!["p2: no verdict returned for policy".to_string()]);
    }

    #[test]
    fn failure_mode_uses_snake_case_names() {
        let mode: PolicyFailureMode = serde_json::from_str("\"fail_open\"").unwrap();
        assert_eq!(mode, PolicyFailureMode::FailOpen);
    }
}
