//! Policy Gate.
//!
//! Evaluates pull request runs against the external policy engine through
//! the circuit-breaking publisher. When the engine cannot answer, the gate
//! applies the configured [`PolicyFailureMode`]; it never returns an error.

use std::sync::Arc;

use pipeline::{
    Decision, FactBundle, ImpactAnalysis, PolicyEngine, PolicyFailureMode, PolicyId, PolicyInput,
};
use resilience::CircuitBreakingPublisher;
use tracing::{info, warn};

use crate::metrics::PipelineMetrics;
use crate::settings::GateSettings;

pub struct PolicyGate {
    engine: Arc<dyn PolicyEngine>,
    calls: CircuitBreakingPublisher,
    settings: GateSettings,
    metrics: Arc<PipelineMetrics>,
}

impl PolicyGate {
    pub fn new(
        engine: Arc<dyn PolicyEngine>,
        calls: CircuitBreakingPublisher,
        settings: GateSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            engine,
            calls,
            settings,
            metrics,
        }
    }

    pub fn failure_mode(&self) -> PolicyFailureMode {
        self.settings.failure_mode
    }

    /// Policies evaluated for a pull request: the ones it names, or the
    /// default policy.
    pub fn policies_for(&self, facts: &FactBundle) -> Vec<PolicyId> {
        match facts.pull_request() {
            Some(pr) if !pr.policies.is_empty() => pr.policies.clone(),
            _ => vec![self.settings.default_policy.clone()],
        }
    }

    /// Decision for a pull request run, `None` for every other subject.
    pub async fn evaluate(
        &self,
        facts: &FactBundle,
        analysis: &ImpactAnalysis,
    ) -> Option<Decision> {
        facts.pull_request()?;

        let policies = self.policies_for(facts);
        let input = PolicyInput {
            facts: facts.clone(),
            policies: policies.clone(),
            risk_score: analysis.risk_score,
            size_category: analysis.size_category,
            analysis_incomplete: analysis.analysis_incomplete,
        };

        let engine: &dyn PolicyEngine = self.engine.as_ref();
        let input = &input;
        let decision = match self.calls.call(move |_| engine.evaluate(input)).await {
            Ok(verdict) => Decision::from_verdict(&policies, verdict),
            Err(err) => {
                warn!(
                    delivery_id = %facts.delivery_id,
                    failure_mode = ?self.settings.failure_mode,
                    error = %err,
                    "Policy engine unavailable, applying failure mode"
                );
                Decision::unavailable(self.settings.failure_mode, &policies)
            }
        };

        info!(
            delivery_id = %facts.delivery_id,
            outcome = decision.outcome.as_str(),
            fallback = decision.fallback,
            policies = policies.len(),
            "Policy decision"
        );
        self.metrics.record_policy_decision(&decision);
        Some(decision)
    }
}
