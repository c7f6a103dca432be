//! Documentation portal port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    DeliveryId, DependencyError, EvaluationResult, RepositoryName, RiskScore, RunId, RunKey,
    Timestamp,
};

/// One documentation publish for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// The run id. Retried publishes carry the same key so the portal can
    /// deduplicate them.
    pub idempotency_key: RunId,
    /// Delivery that started the run.
    pub delivery_id: DeliveryId,
    /// Repository.
    pub repository: RepositoryName,
    /// Run subject.
    pub run_key: RunKey,
    /// Page title.
    pub title: String,
    /// Markdown body.
    pub body: String,
    /// Risk score, when analysis ran.
    pub risk_score: Option<RiskScore>,
    /// Gate outcome, for pull request runs.
    pub policy_outcome: Option<EvaluationResult>,
    /// When the triggering event was received; drives docs freshness.
    pub event_received_at: Timestamp,
}

/// Portal acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Where the page lives, if the portal says.
    pub location: Option<String>,
    /// When the portal accepted it.
    pub published_at: Timestamp,
}

/// Downstream documentation portal.
#[async_trait]
pub trait DocumentationPortal: Send + Sync {
    /// Publishes (or re-publishes, idempotently) a run summary.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError>;
}
