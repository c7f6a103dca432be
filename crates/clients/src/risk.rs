//! External risk scoring adapter: `POST {base}/score` with a `RiskInput`,
//! answered by `{"score": <0..=100>}`.

use async_trait::async_trait;
use pipeline::{DependencyError, DependencyName, RiskInput, RiskScore, RiskScorer};
use serde::Deserialize;

use crate::http::{HttpClientConfig, HttpTarget};

/// [`RiskScorer`] over HTTP. Scores outside `[0, 100]` are rejected.
#[derive(Debug, Clone)]
pub struct HttpRiskScorer {
    target: HttpTarget,
}

impl HttpRiskScorer {
    pub fn new(dependency: DependencyName, config: &HttpClientConfig) -> Result<Self, DependencyError> {
        Ok(Self {
            target: HttpTarget::new(dependency, config)?,
        })
    }
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
}

#[async_trait]
impl RiskScorer for HttpRiskScorer {
    async fn score(&self, input: &RiskInput) -> Result<RiskScore, DependencyError> {
        let response = self
            .target
            .client()
            .post(self.target.url("/score"))
            .json(input)
            .send()
            .await
            .map_err(|e| self.target.transport_error(e))?;
        let body: ScoreResponse = self
            .target
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.target.transport_error(e))?;
        RiskScore::new(body.score).ok_or_else(|| {
            DependencyError::permanent(
                self.target.dependency(),
                format!("risk score {} is outside [0, 100]", body.score),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RiskInput {
        RiskInput {
            change_type: "fix".into(),
            lines_changed: 12,
            files_touched: 1,
            coverage_delta: None,
            security_flag: false,
            touches_tests: true,
        }
    }

    #[tokio::test]
    async fn out_of_range_score_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/score")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score": 140}"#)
            .create_async()
            .await;

        let scorer = HttpRiskScorer::new(
            DependencyName::new("risk-scorer").unwrap(),
            &HttpClientConfig::new(server.url()),
        )
        .unwrap();
        let err = scorer.score(&input()).await.unwrap_err();
        assert!(matches!(err, DependencyError::Permanent { .. }));
    }

    #[tokio::test]
    async fn score_is_returned() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/score")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score": 42.5}"#)
            .create_async()
            .await;

        let scorer = HttpRiskScorer::new(
            DependencyName::new("risk-scorer").unwrap(),
            &HttpClientConfig::new(server.url()),
        )
        .unwrap();
        assert_eq!(scorer.score(&input()).await.unwrap().as_f64(), 42.5);
    }
}
