//! OPA-style policy engine adapter.
//!
//! Request: `POST {base}/{decision_path}` with `{"input": <PolicyInput>}`.
//! Response: `{"result": {"decisions": [{"policy", "allow", "reason"}]}}`.
//! An absent `result` means the decision path is undefined, which is a
//! deployment error and therefore permanent.

use async_trait::async_trait;
use pipeline::{
    DependencyError, DependencyName, EvaluationResult, PolicyEngine, PolicyId, PolicyInput,
    PolicyResult, Verdict,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{HttpClientConfig, HttpTarget};

/// [`PolicyEngine`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPolicyEngine {
    target: HttpTarget,
    decision_path: String,
}

impl HttpPolicyEngine {
    /// Creates an adapter posting to `decision_path` (e.g. `/v1/data/codex/gate`).
    pub fn new(
        dependency: DependencyName,
        config: &HttpClientConfig,
        decision_path: impl Into<String>,
    ) -> Result<Self, DependencyError> {
        Ok(Self {
            target: HttpTarget::new(dependency, config)?,
            decision_path: decision_path.into(),
        })
    }
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    input: &'a PolicyInput,
}

#[derive(Deserialize)]
struct DecisionResponse {
    result: Option<DecisionDocument>,
}

#[derive(Deserialize)]
struct DecisionDocument {
    #[serde(default)]
    decisions: Vec<PolicyDecision>,
}

#[derive(Deserialize)]
struct PolicyDecision {
    policy: String,
    allow: bool,
    #[serde(default)]
    reason: String,
}

fn into_verdict(
    dependency: &DependencyName,
    response: DecisionResponse,
) -> Result<Verdict, DependencyError> {
    let document = response.result.ok_or_else(|| {
        DependencyError::permanent(dependency, "decision document is undefined")
    })?;

    let mut results = Vec::with_capacity(document.decisions.len());
    for decision in document.decisions {
        let policy_id = PolicyId::new(decision.policy).ok_or_else(|| {
            DependencyError::permanent(dependency, "decision without a policy id")
        })?;
        let (result, default_reason) = if decision.allow {
            (EvaluationResult::Allow, "allowed")
        } else {
            (EvaluationResult::Deny, "denied")
        };
        let reason = if decision.reason.trim().is_empty() {
            default_reason.to_string()
        } else {
            decision.reason
        };
        results.push(PolicyResult {
            policy_id,
            result,
            reason,
        });
    }
    Ok(Verdict { results })
}

#[async_trait]
impl PolicyEngine for HttpPolicyEngine {
    async fn evaluate(&self, input: &PolicyInput) -> Result<Verdict, DependencyError> {
        let response = self
            .target
            .client()
            .post(self.target.url(&self.decision_path))
            .json(&DecisionRequest { input })
            .send()
            .await
            .map_err(|e| self.target.transport_error(e))?;
        let response = self.target.check(response).await?;
        let body: DecisionResponse = response
            .json()
            .await
            .map_err(|e| self.target.transport_error(e))?;

        let verdict = into_verdict(self.target.dependency(), body)?;
        debug!(
            policies = input.policies.len(),
            returned = verdict.results.len(),
            "Policy engine returned verdict"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{extract_facts, Delivery, DeliveryId, RiskScore, SizeCategory};
    use serde_json::json;

    fn dep() -> DependencyName {
        DependencyName::new("policy-engine").unwrap()
    }

    fn input() -> PolicyInput {
        let delivery = Delivery::new(
            DeliveryId::new("d-1").unwrap(),
            "pull_request",
            json!({
                "action": "opened",
                "repository": {"full_name": "acme/widgets", "owner": {"login": "acme"}},
                "pull_request": {
                    "number": 3,
                    "title": "feat: sprockets",
                    "user": {"login": "octo"},
                    "state": "open",
                    "changed_files": 1,
                    "additions": 10,
                    "deletions": 2,
                    "labels": [],
                    "created_at": "2026-01-01T00:00:00Z",
                    "updated_at": "2026-01-01T00:00:00Z"
                }
            }),
        );
        PolicyInput {
            facts: extract_facts(&delivery).unwrap(),
            policies: vec![PolicyId::new("require-review").unwrap()],
            risk_score: RiskScore::clamped(30.0),
            size_category: SizeCategory::XS,
            analysis_incomplete: false,
        }
    }

    #[test]
    fn decisions_map_onto_verdict() {
        let response: DecisionResponse = serde_json::from_value(json!({
            "result": {"decisions": [
                {"policy": "require-review", "allow": false, "reason": "needs two approvals"},
                {"policy": "size-limit", "allow": true}
            ]}
        }))
        .unwrap();
        let verdict = into_verdict(&dep(), response).unwrap();
        assert_eq!(verdict.results.len(), 2);
        assert_eq!(verdict.results[0].result, EvaluationResult::Deny);
        assert_eq!(verdict.results[0].reason, "needs two approvals");
        assert_eq!(verdict.results[1].reason, "allowed");
    }

    #[test]
    fn undefined_decision_is_permanent() {
        let response: DecisionResponse = serde_json::from_value(json!({})).unwrap();
        let err = into_verdict(&dep(), response).unwrap_err();
        assert!(matches!(err, DependencyError::Permanent { .. }));
    }

    #[tokio::test]
    async fn posts_input_document_and_parses_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/data/codex/gate")
            .match_body(mockito::Matcher::PartialJson(json!({
                "input": {"policies": ["require-review"]}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":{"decisions":[{"policy":"require-review","allow":true,"reason":"ok"}]}}"#)
            .create_async()
            .await;

        let engine = HttpPolicyEngine::new(
            dep(),
            &HttpClientConfig::new(server.url()),
            "/v1/data/codex/gate",
        )
        .unwrap();
        let verdict = engine.evaluate(&input()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(verdict.results[0].result, EvaluationResult::Allow);
    }

    #[tokio::test]
    async fn server_errors_surface_as_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/data/codex/gate")
            .with_status(503)
            .create_async()
            .await;

        let engine = HttpPolicyEngine::new(
            dep(),
            &HttpClientConfig::new(server.url()),
            "/v1/data/codex/gate",
        )
        .unwrap();
        let err = engine.evaluate(&input()).await.unwrap_err();
        assert!(matches!(err, DependencyError::Transient { .. }));
    }
}
