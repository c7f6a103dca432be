//! Shared fakes and fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestrator::{
    Alert, AlertSink, Collaborators, Orchestrator, OrchestratorBuilder, OrchestratorSettings,
    Stores,
};
use pipeline::{
    CommitSha, ComplexityScore, Delivery, DeliveryId, DependencyError, DependencyName,
    DocumentationPortal, EvaluationResult, FilePath, HeuristicRiskScorer, PolicyEngine,
    PolicyInput, PolicyResult, PublishReceipt, PublishRequest, RepositoryName, RunCheckpoint,
    RunId, RunState, RunStore, SourceSnapshot, StorageError, SymbolFacts, SymbolName, SymbolType,
    Timestamp, Verdict,
};
use resilience::RetryConfig;
use serde_json::json;
use store::SqliteStore;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// One function per file, named after the file.
pub struct StaticSnapshot;

#[async_trait]
impl SourceSnapshot for StaticSnapshot {
    async fn symbols(
        &self,
        _repository: &RepositoryName,
        _sha: Option<&CommitSha>,
        path: &FilePath,
    ) -> Result<Vec<SymbolFacts>, DependencyError> {
        let stem = path
            .as_str()
            .rsplit('/')
            .next()
            .unwrap_or("file")
            .trim_end_matches(".rs");
        Ok(vec![SymbolFacts {
            name: SymbolName::new(format!("{stem}_entry")).unwrap(),
            file_path: path.clone(),
            symbol_type: SymbolType::Function,
            complexity: ComplexityScore::new(3.0).unwrap(),
            calls: Vec::new(),
            embedding: None,
        }])
    }

    async fn code_owners(
        &self,
        _repository: &RepositoryName,
        _sha: Option<&CommitSha>,
    ) -> Result<Option<String>, DependencyError> {
        Ok(Some(CODEOWNERS.to_string()))
    }
}

pub const CODEOWNERS: &str = "* @acme/core\n/src/lib.rs @alice\n";

/// Allows every requested policy.
pub struct AllowAllEngine;

#[async_trait]
impl PolicyEngine for AllowAllEngine {
    async fn evaluate(&self, input: &PolicyInput) -> Result<Verdict, DependencyError> {
        Ok(Verdict {
            results: input
                .policies
                .iter()
                .map(|policy| PolicyResult {
                    policy_id: policy.clone(),
                    result: EvaluationResult::Allow,
                    reason: "within limits".to_string(),
                })
                .collect(),
        })
    }
}

/// Allows every policy once opened; counts every evaluation.
pub struct GatedPolicyEngine {
    gate: watch::Sender<bool>,
    pub calls: AtomicU32,
}

impl GatedPolicyEngine {
    pub fn closed() -> Self {
        Self {
            gate: watch::channel(false).0,
            calls: AtomicU32::new(0),
        }
    }

    pub fn opened() -> Self {
        let engine = Self::closed();
        engine.gate.send_replace(true);
        engine
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyEngine for GatedPolicyEngine {
    async fn evaluate(&self, input: &PolicyInput) -> Result<Verdict, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        AllowAllEngine.evaluate(input).await
    }
}

/// Always answers 503.
#[derive(Default)]
pub struct FailingPolicyEngine {
    pub calls: AtomicU32,
}

#[async_trait]
impl PolicyEngine for FailingPolicyEngine {
    async fn evaluate(&self, _input: &PolicyInput) -> Result<Verdict, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DependencyError::transient(
            &DependencyName::new("policy-engine").unwrap(),
            "503 Service Unavailable",
        ))
    }
}

/// Records every publish and acknowledges it.
#[derive(Default)]
pub struct RecordingPortal {
    pub requests: Mutex<Vec<PublishRequest>>,
}

impl RecordingPortal {
    pub fn published(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentationPortal for RecordingPortal {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PublishReceipt {
            location: Some(format!("https://docs.test/runs/{}", request.idempotency_key)),
            published_at: Timestamp::now(),
        })
    }
}

/// Fails the first `failures` calls with a transient error, then records.
pub struct FaultyPortal {
    armed: Mutex<HashSet<DeliveryId>>,
    pub attempts: AtomicU32,
    pub inner: RecordingPortal,
}

impl FaultyPortal {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(HashSet::new()),
            attempts: AtomicU32::new(0),
            inner: RecordingPortal::default(),
        }
    }

    /// The next publish referencing `delivery_id` fails once.
    pub fn fail_next(&self, delivery_id: &str) {
        self.armed
            .lock()
            .unwrap()
            .insert(DeliveryId::new(delivery_id).unwrap());
    }
}

#[async_trait]
impl DocumentationPortal for FaultyPortal {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let tripped = self.armed.lock().unwrap().remove(&request.delivery_id);
        if tripped {
            return Err(DependencyError::transient(
                &DependencyName::new("docs-portal").unwrap(),
                "502 Bad Gateway",
            ));
        }
        self.inner.publish(request).await
    }
}

/// Sleeps before acknowledging.
pub struct SlowPortal {
    pub delay: Duration,
    pub inner: RecordingPortal,
}

impl SlowPortal {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: RecordingPortal::default(),
        }
    }
}

#[async_trait]
impl DocumentationPortal for SlowPortal {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(request).await
    }
}

/// Holds every publish until [`GatedPortal::open`] is called.
pub struct GatedPortal {
    gate: watch::Sender<bool>,
    pub entered: AtomicU32,
    pub inner: RecordingPortal,
}

impl Default for GatedPortal {
    fn default() -> Self {
        Self {
            gate: watch::channel(false).0,
            entered: AtomicU32::new(0),
            inner: RecordingPortal::default(),
        }
    }
}

impl GatedPortal {
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn entered(&self) -> u32 {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentationPortal for GatedPortal {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, DependencyError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.publish(request).await
    }
}

/// How [`TroubledRuns`] misbehaves when committing one state.
#[derive(Debug, Clone, Copy)]
pub enum CommitTrouble {
    /// The write commits, then its acknowledgement is late.
    Slow(Duration),
    /// The write commits, then the caller is told it conflicted.
    LostAck,
}

/// Run store over SQLite that misbehaves after committing `state`.
pub struct TroubledRuns {
    pub inner: Arc<SqliteStore>,
    pub state: RunState,
    pub trouble: CommitTrouble,
    pub saves: AtomicU32,
}

impl TroubledRuns {
    pub fn new(inner: &Arc<SqliteStore>, state: RunState, trouble: CommitTrouble) -> Self {
        Self {
            inner: Arc::clone(inner),
            state,
            trouble,
            saves: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RunStore for TroubledRuns {
    async fn load(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StorageError> {
        self.inner.load(run_id).await
    }

    async fn save(
        &self,
        checkpoint: &RunCheckpoint,
        expected: RunState,
    ) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(checkpoint, expected).await?;
        if checkpoint.state != self.state {
            return Ok(());
        }
        match self.trouble {
            CommitTrouble::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            CommitTrouble::LostAck => Err(StorageError::conflict("save run", "database is locked")),
        }
    }

    async fn unfinished(&self) -> Result<Vec<RunCheckpoint>, StorageError> {
        self.inner.unfinished().await
    }

    async fn by_delivery(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<RunCheckpoint>, StorageError> {
        self.inner.by_delivery(delivery_id).await
    }
}

#[derive(Default)]
pub struct CollectingAlerts {
    pub alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlerts {
    pub fn raised(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for CollectingAlerts {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn pr_payload(number: u64, title: &str) -> serde_json::Value {
    json!({
        "action": "opened",
        "repository": { "full_name": "acme/widgets", "owner": { "login": "acme" } },
        "pull_request": {
            "number": number,
            "title": title,
            "user": { "login": "octocat" },
            "state": "open",
            "head": { "sha": "0123456789abcdef" },
            "changed_files": 2,
            "additions": 40,
            "deletions": 5,
            "labels": [],
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:05:00Z"
        },
        "files": [
            { "path": "src/sprocket.rs", "status": "added" },
            { "path": "src/lib.rs", "status": "modified" }
        ]
    })
}

pub fn pr_delivery(id: &str, number: u64) -> Delivery {
    Delivery::new(
        DeliveryId::new(id).unwrap(),
        "pull_request",
        pr_payload(number, "feat: add sprockets"),
    )
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        step_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(20),
        max_step_attempts: 3,
        step_retry: fast_retry(),
    }
}

pub fn collaborators(
    policy_engine: Arc<dyn PolicyEngine>,
    portal: Arc<dyn DocumentationPortal>,
) -> Collaborators {
    Collaborators {
        snapshot: Arc::new(StaticSnapshot),
        coverage: None,
        risk_scorer: Arc::new(HeuristicRiskScorer::default()),
        policy_engine,
        portal,
    }
}

pub fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

/// Builder over `store` with fast retries and the given collaborators.
pub fn builder(store: &Arc<SqliteStore>, collaborators: Collaborators) -> OrchestratorBuilder {
    builder_with(Stores::from_shared(Arc::clone(store)), collaborators)
}

/// Builder over explicit stores with fast retries.
pub fn builder_with(stores: Stores, collaborators: Collaborators) -> OrchestratorBuilder {
    Orchestrator::builder(stores, collaborators)
        .settings(fast_settings())
        .retry(fast_retry())
}

/// Polls `condition` every 5ms until it holds, for at most five seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
