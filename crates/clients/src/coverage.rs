//! CI coverage adapter: `GET {base}/coverage/{owner}/{repo}/{sha}` returning
//! `{"delta": <percentage points> | null}`. `404` means CI has not reported.

use async_trait::async_trait;
use pipeline::{CommitSha, CoverageReporter, DependencyError, DependencyName, RepositoryName};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::http::{HttpClientConfig, HttpTarget};

/// [`CoverageReporter`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCoverageReporter {
    target: HttpTarget,
}

impl HttpCoverageReporter {
    pub fn new(dependency: DependencyName, config: &HttpClientConfig) -> Result<Self, DependencyError> {
        Ok(Self {
            target: HttpTarget::new(dependency, config)?,
        })
    }
}

#[derive(Deserialize)]
struct CoverageReport {
    delta: Option<f64>,
}

#[async_trait]
impl CoverageReporter for HttpCoverageReporter {
    async fn coverage_delta(
        &self,
        repository: &RepositoryName,
        sha: &CommitSha,
    ) -> Result<Option<f64>, DependencyError> {
        let path = format!(
            "/coverage/{}/{}/{}",
            repository.owner(),
            repository.short_name(),
            sha
        );
        let response = self
            .target
            .client()
            .get(self.target.url(&path))
            .send()
            .await
            .map_err(|e| self.target.transport_error(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let report: CoverageReport = self
            .target
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.target.transport_error(e))?;
        Ok(report.delta.filter(|d| d.is_finite()))
    }
}
