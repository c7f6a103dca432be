//! Shared HTTP plumbing: client construction and failure classification.

use std::time::Duration;

use pipeline::{DependencyError, DependencyName};
use reqwest::{header::RETRY_AFTER, Response, StatusCode};

/// Connection settings for one downstream HTTP service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    /// Base URL, e.g. `http://opa:8181`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl HttpClientConfig {
    /// Defaults: 10 s timeout, `codex/<version>` user agent.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            user_agent: format!("codex/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A configured client bound to one dependency.
#[derive(Debug, Clone)]
pub(crate) struct HttpTarget {
    client: reqwest::Client,
    base_url: String,
    dependency: DependencyName,
}

impl HttpTarget {
    pub(crate) fn new(
        dependency: DependencyName,
        config: &HttpClientConfig,
    ) -> Result<Self, DependencyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                DependencyError::permanent(&dependency, format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dependency,
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn dependency(&self) -> &DependencyName {
        &self.dependency
    }

    /// Joins `path` onto the base URL.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Connection failures and timeouts may succeed later; a body we cannot
    /// decode will not.
    pub(crate) fn transport_error(&self, error: reqwest::Error) -> DependencyError {
        if error.is_decode() {
            DependencyError::permanent(&self.dependency, format!("undecodable response: {error}"))
        } else {
            DependencyError::transient(&self.dependency, error.to_string())
        }
    }

    /// Passes successful responses through and classifies the rest.
    pub(crate) async fn check(&self, response: Response) -> Result<Response, DependencyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(&self.dependency, status, retry_after, &body))
    }
}

/// Maps a non-success HTTP status onto the dependency error taxonomy.
///
/// 5xx, 429 and 408 are transient (honouring `Retry-After`); every other
/// status is permanent.
pub fn classify_status(
    dependency: &DependencyName,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> DependencyError {
    let mut message = format!("HTTP {status}");
    let snippet: String = body.trim().chars().take(200).collect();
    if !snippet.is_empty() {
        message.push_str(": ");
        message.push_str(&snippet);
    }

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        DependencyError::Transient {
            dependency: dependency.clone(),
            message,
            retry_after,
        }
    } else {
        DependencyError::permanent(dependency, message)
    }
}
