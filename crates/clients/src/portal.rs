//! Documentation portal adapter.
//!
//! Every publish carries the run id in an `Idempotency-Key` header. A `409`
//! means the portal already holds a page for that key, which is the outcome
//! a retried publish wants, so it is reported as success.

use async_trait::async_trait;
use pipeline::{
    DependencyError, DependencyName, DocumentationPortal, PublishReceipt, PublishRequest,
    Timestamp,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::info;

use crate::http::{HttpClientConfig, HttpTarget};

/// Header carrying the run id.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// [`DocumentationPortal`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDocumentationPortal {
    target: HttpTarget,
    pages_path: String,
}

impl HttpDocumentationPortal {
    /// Creates an adapter posting pages to `{base}/v1/pages`.
    pub fn new(dependency: DependencyName, config: &HttpClientConfig) -> Result<Self, DependencyError> {
        Ok(Self {
            target: HttpTarget::new(dependency, config)?,
            pages_path: "/v1/pages".to_string(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageAck {
    location: Option<String>,
}

#[async_trait]
impl DocumentationPortal for HttpDocumentationPortal {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError> {
        let response = self
            .target
            .client()
            .post(self.target.url(&self.pages_path))
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| self.target.transport_error(e))?;

        if response.status() == StatusCode::CONFLICT {
            let ack: PageAck = response.json().await.unwrap_or_default();
            info!(
                run_id = %request.idempotency_key,
                "Documentation page already published for this run"
            );
            return Ok(PublishReceipt {
                location: ack.location,
                published_at: Timestamp::now(),
            });
        }

        let response = self.target.check(response).await?;
        // An empty 2xx body is a valid acknowledgement.
        let ack: PageAck = response.json().await.unwrap_or_default();
        Ok(PublishReceipt {
            location: ack.location,
            published_at: Timestamp::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{DeliveryId, PullRequestNumber, RepositoryName, RunId, RunKey};

    fn request(run_id: RunId) -> PublishRequest {
        let repository = RepositoryName::new("acme/widgets").unwrap();
        PublishRequest {
            idempotency_key: run_id,
            delivery_id: DeliveryId::new("d-1").unwrap(),
            repository: repository.clone(),
            run_key: RunKey::pull_request(repository, PullRequestNumber::new(4)),
            title: "acme/widgets#4".into(),
            body: "summary".into(),
            risk_score: None,
            policy_outcome: None,
            event_received_at: Timestamp::now(),
        }
    }

    fn portal(url: String) -> HttpDocumentationPortal {
        HttpDocumentationPortal::new(
            DependencyName::new("docs-portal").unwrap(),
            &HttpClientConfig::new(url),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sends_run_id_as_idempotency_key() {
        let run_id = RunId::new_random();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/pages")
            .match_header("idempotency-key", run_id.to_string().as_str())
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"location":"/docs/acme/widgets/4"}"#)
            .create_async()
            .await;

        let receipt = portal(server.url()).publish(&request(run_id)).await.unwrap();
        mock.assert_async().await;
        assert_eq!(receipt.location.as_deref(), Some("/docs/acme/widgets/4"));
    }

    #[tokio::test]
    async fn conflict_means_already_published() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/pages")
            .with_status(409)
            .create_async()
            .await;

        let receipt = portal(server.url())
            .publish(&request(RunId::new_random()))
            .await
            .unwrap();
        assert_eq!(receipt.location, None);
    }

    #[tokio::test]
    async fn rejected_page_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/pages")
            .with_status(400)
            .with_body("title too long")
            .create_async()
            .await;

        let err = portal(server.url())
            .publish(&request(RunId::new_random()))
            .await
            .unwrap_err();
        assert!(matches!(err, DependencyError::Permanent { .. }));
    }
}
