//! Dependency failures: publish retry, graph-query breaker fallback, and the
//! policy gate failure modes.

mod support;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator::{Alert, GateSettings, GraphQueryService, IntakeOutcome};
use pipeline::{
    DeliveryId, DependencyName, Direction, EdgeKind, Embedding, EntityId, EntityKind,
    EntityRecord, EvaluationResult, GraphStats, GraphWriteBatch, GraphWriteReceipt,
    KnowledgeGraph, NaturalKey, Neighbor, PolicyEvaluation, PolicyFailureMode, PolicyId,
    PullRequestNumber, RepositoryName, RunState, RunStore, SimilarEntity, StorageError,
};
use resilience::{BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakingPublisher, RetryConfig};
use support::{AllowAllEngine, CollectingAlerts, FailingPolicyEngine, FaultyPortal, RecordingPortal};

fn repo() -> RepositoryName {
    RepositoryName::new("acme/widgets").unwrap()
}

// ---------------------------------------------------------------------------
// Publish retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_fault_is_retried_and_published_once() {
    let store = support::store();
    let portal = Arc::new(FaultyPortal::new());
    portal.fail_next("pub-1");
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), portal.clone()),
    )
    .build();

    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("pub-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);

    // The trigger is spent and scoped to one delivery.
    let IntakeOutcome::Accepted(other) =
        orchestrator.submit(support::pr_delivery("pub-2", 43)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(other.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    assert_eq!(portal.attempts.load(Ordering::SeqCst), 3);
    let published = portal.inner.published();
    assert_eq!(published.len(), 2);
    assert_eq!(
        published
            .iter()
            .filter(|request| request.idempotency_key == run_id)
            .count(),
        1
    );

    let checkpoint = store.load(run_id).await.unwrap().unwrap();
    assert!(checkpoint.publish.is_some());
    assert!(orchestrator
        .breaker_states()
        .iter()
        .all(|(_, state)| *state == BreakerState::Closed));
}

// ---------------------------------------------------------------------------
// Graph query breaker
// ---------------------------------------------------------------------------

/// Delegates to a real graph, failing reads while `failing` is set.
struct FlakyGraph {
    inner: Arc<dyn KnowledgeGraph>,
    failing: AtomicBool,
    reads: AtomicU32,
}

impl FlakyGraph {
    fn read(&self) -> Result<(), StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("read graph", "connection reset"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KnowledgeGraph for FlakyGraph {
    async fn apply(&self, batch: &GraphWriteBatch) -> Result<GraphWriteReceipt, StorageError> {
        self.inner.apply(batch).await
    }

    async fn entity(
        &self,
        kind: EntityKind,
        key: &NaturalKey,
    ) -> Result<Option<EntityRecord>, StorageError> {
        self.read()?;
        self.inner.entity(kind, key).await
    }

    async fn entities_in(
        &self,
        kind: EntityKind,
        repository: &RepositoryName,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        self.read()?;
        self.inner.entities_in(kind, repository).await
    }

    async fn neighbors(
        &self,
        id: EntityId,
        direction: Direction,
        edge: Option<EdgeKind>,
    ) -> Result<Vec<Neighbor>, StorageError> {
        self.read()?;
        self.inner.neighbors(id, direction, edge).await
    }

    async fn nearest(
        &self,
        kind: EntityKind,
        query: &Embedding,
        repository: Option<&RepositoryName>,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, StorageError> {
        self.read()?;
        self.inner.nearest(kind, query, repository, limit).await
    }

    async fn evaluations(
        &self,
        pull_request: &NaturalKey,
    ) -> Result<Vec<PolicyEvaluation>, StorageError> {
        self.read()?;
        self.inner.evaluations(pull_request).await
    }

    async fn stats(&self) -> Result<GraphStats, StorageError> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn open_graph_query_circuit_serves_cached_answers_until_probe() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();
    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("query-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    let cool_down = Duration::from_millis(300);
    let graph = Arc::new(FlakyGraph {
        inner: store.clone(),
        failing: AtomicBool::new(false),
        reads: AtomicU32::new(0),
    });
    let breaker = Arc::new(CircuitBreaker::new(
        DependencyName::new("graph-query").unwrap(),
        BreakerConfig {
            consecutive_failures: 5,
            failure_ratio: 1.0,
            window_size: 0,
            cool_down,
        },
    ));
    let queries = GraphQueryService::new(
        graph.clone(),
        CircuitBreakingPublisher::new(Arc::clone(&breaker), RetryConfig::no_retry()),
    );
    let key = NaturalKey::pull_request(&repo(), PullRequestNumber::new(42));

    // A live answer primes the fallback cache.
    let live = queries.entity(EntityKind::PullRequest, &key).await.unwrap();
    assert!(!live.is_fallback());
    let expected = live.into_inner();
    assert!(expected.is_some());

    graph.failing.store(true, Ordering::SeqCst);
    for _ in 0..5 {
        assert!(queries.entity(EntityKind::PullRequest, &key).await.is_err());
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    let reads_when_opened = graph.reads.load(Ordering::SeqCst);
    assert_eq!(reads_when_opened, 6);

    for _ in 0..5 {
        let answer = queries.entity(EntityKind::PullRequest, &key).await.unwrap();
        assert!(answer.is_fallback());
        assert_eq!(answer.into_inner(), expected);
    }
    assert_eq!(graph.reads.load(Ordering::SeqCst), reads_when_opened);

    tokio::time::sleep(cool_down + Duration::from_millis(50)).await;
    graph.failing.store(false, Ordering::SeqCst);
    let probe = queries.entity(EntityKind::PullRequest, &key).await.unwrap();
    assert!(!probe.is_fallback());
    assert_eq!(graph.reads.load(Ordering::SeqCst), reads_when_opened + 1);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn graph_query_fallback_keeps_a_bounded_number_of_answers() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();
    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("bounded-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    let graph = Arc::new(FlakyGraph {
        inner: store.clone(),
        failing: AtomicBool::new(false),
        reads: AtomicU32::new(0),
    });
    let breaker = Arc::new(CircuitBreaker::new(
        DependencyName::new("graph-query").unwrap(),
        BreakerConfig {
            consecutive_failures: 2,
            failure_ratio: 1.0,
            window_size: 0,
            cool_down: Duration::from_secs(60),
        },
    ));
    let queries = GraphQueryService::with_cache_capacity(
        graph.clone(),
        CircuitBreakingPublisher::new(Arc::clone(&breaker), RetryConfig::no_retry()),
        2,
    );
    let lookups = [
        (EntityKind::Repository, NaturalKey::repository(&repo())),
        (EntityKind::PullRequest, NaturalKey::pull_request(&repo(), PullRequestNumber::new(42))),
        (EntityKind::File, NaturalKey::from_raw("acme/widgets:src/lib.rs")),
    ];
    for (kind, key) in &lookups {
        let live = queries.entity(*kind, key).await.unwrap();
        assert!(live.into_inner().is_some());
    }

    graph.failing.store(true, Ordering::SeqCst);
    let (kind, key) = &lookups[2];
    for _ in 0..2 {
        assert!(queries.entity(*kind, key).await.is_err());
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    // The oldest answer was evicted; the two newest are still served.
    let (kind, key) = &lookups[0];
    assert!(queries.entity(*kind, key).await.is_err());
    for (kind, key) in &lookups[1..] {
        let answer = queries.entity(*kind, key).await.unwrap();
        assert!(answer.is_fallback());
        assert_eq!(answer.into_inner().map(|e| e.key), Some(key.clone()));
    }
}

#[tokio::test]
async fn pull_request_view_lists_edges_and_evaluations() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();
    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("view-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);

    let view = orchestrator
        .query_service()
        .pull_request(&repo(), PullRequestNumber::new(42))
        .await
        .unwrap()
        .into_inner()
        .unwrap();
    let touches = view
        .edges
        .iter()
        .filter(|n| n.edge == EdgeKind::Touches)
        .count();
    let defines = view
        .edges
        .iter()
        .filter(|n| n.edge == EdgeKind::Defines)
        .count();
    assert_eq!(touches, 2);
    assert_eq!(defines, 2);
    assert!(view.edges.iter().any(|n| n.edge == EdgeKind::GovernedBy));
    assert_eq!(view.evaluations.len(), 1);
    assert_eq!(view.evaluations[0].result, EvaluationResult::Allow);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn changed_files_link_to_their_code_owners() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();
    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("owners-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    let mut owners = Vec::new();
    for path in ["src/sprocket.rs", "src/lib.rs"] {
        let file = store
            .entity(EntityKind::File, &NaturalKey::from_raw(format!("acme/widgets:{path}")))
            .await
            .unwrap()
            .unwrap();
        let owned_by = store
            .neighbors(file.id, Direction::Outgoing, Some(EdgeKind::OwnedBy))
            .await
            .unwrap();
        assert_eq!(owned_by.len(), 1);
        assert_eq!(owned_by[0].entity.kind, EntityKind::Owner);
        owners.push(owned_by[0].entity.key.to_string());
    }
    assert_eq!(owners, ["@acme/core", "@alice"]);

    let team = store
        .entity(EntityKind::Owner, &NaturalKey::from_raw("@acme/core"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(team.attr_str("type"), Some("team"));
}

// ---------------------------------------------------------------------------
// Policy gate failure modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_policy_engine_fails_closed_by_default() {
    let store = support::store();
    let engine = Arc::new(FailingPolicyEngine::default());
    let orchestrator = support::builder(
        &store,
        support::collaborators(engine.clone(), Arc::new(RecordingPortal::default())),
    )
    .build();

    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("deny-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    let checkpoint = store
        .by_delivery(&DeliveryId::new("deny-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    let decision = checkpoint.decision.unwrap();
    assert_eq!(decision.outcome, EvaluationResult::Deny);
    assert!(decision.fallback);
    assert!(!decision.audit_fail_open);

    let evaluations = store
        .evaluations(&NaturalKey::pull_request(&repo(), PullRequestNumber::new(42)))
        .await
        .unwrap();
    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0].result, EvaluationResult::Deny);
    assert_eq!(evaluations[0].policy_id.as_str(), "default");
    assert_eq!(orchestrator.metrics().snapshot().policy_fallbacks, 1);
}

#[tokio::test]
async fn fail_open_allows_and_raises_an_audit_alert() {
    let store = support::store();
    let alerts = Arc::new(CollectingAlerts::default());
    let orchestrator = support::builder(
        &store,
        support::collaborators(
            Arc::new(FailingPolicyEngine::default()),
            Arc::new(RecordingPortal::default()),
        ),
    )
    .gate(GateSettings {
        failure_mode: PolicyFailureMode::FailOpen,
        default_policy: PolicyId::new("baseline").unwrap(),
    })
    .alerts(alerts.clone())
    .build();

    let IntakeOutcome::Accepted(handle) =
        orchestrator.submit(support::pr_delivery("open-1", 42)).await.unwrap()
    else {
        panic!("expected a run");
    };
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    orchestrator.shutdown().await;

    let decision = store.load(run_id).await.unwrap().unwrap().decision.unwrap();
    assert_eq!(decision.outcome, EvaluationResult::Allow);
    assert!(decision.audit_fail_open);

    let raised = alerts.raised();
    assert!(raised.iter().any(|alert| matches!(
        alert,
        Alert::PolicyFailOpen { run_id: id, .. } if *id == run_id
    )));

    let pr = store
        .entity(
            EntityKind::PullRequest,
            &NaturalKey::pull_request(&repo(), PullRequestNumber::new(42)),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pr.attributes.get("audit_fail_open"), Some(&serde_json::json!(true)));
}
