//! Read-side graph queries.
//!
//! The external query surface reads the graph through its own breaker
//! (`graph-query`). While that circuit is open, lookups are served from the
//! last known good answer for the same query; similarity search falls back
//! to an empty result. Each answer cache keeps a bounded number of queries.

use std::sync::Arc;

use pipeline::{
    DependencyError, DependencyName, Direction, Embedding, EntityKind, EntityRecord,
    KnowledgeGraph, NaturalKey, Neighbor, PolicyEvaluation, PullRequestNumber, RepositoryName,
    SimilarEntity, StorageError,
};
use resilience::{
    CircuitBreakingPublisher, FallbackCache, Guarded, LastKnownGood, NeutralDefault,
    DEFAULT_FALLBACK_CAPACITY,
};
use serde::{Deserialize, Serialize};

/// A pull request with its outgoing relationships and policy history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestView {
    pub pull_request: EntityRecord,
    pub edges: Vec<Neighbor>,
    pub evaluations: Vec<PolicyEvaluation>,
}

pub struct GraphQueryService {
    graph: Arc<dyn KnowledgeGraph>,
    calls: CircuitBreakingPublisher,
    entities: LastKnownGood<(EntityKind, NaturalKey), Option<EntityRecord>>,
    pull_requests: LastKnownGood<NaturalKey, Option<PullRequestView>>,
    no_matches: NeutralDefault<Vec<SimilarEntity>>,
}

fn unavailable(dependency: &DependencyName, err: StorageError) -> DependencyError {
    if err.retry_policy().is_retryable() {
        DependencyError::transient(dependency, err.to_string())
    } else {
        DependencyError::permanent(dependency, err.to_string())
    }
}

impl GraphQueryService {
    pub fn new(graph: Arc<dyn KnowledgeGraph>, calls: CircuitBreakingPublisher) -> Self {
        Self::with_cache_capacity(graph, calls, DEFAULT_FALLBACK_CAPACITY)
    }

    /// Like [`new`](Self::new), keeping at most `capacity` fallback answers
    /// per query kind.
    pub fn with_cache_capacity(
        graph: Arc<dyn KnowledgeGraph>,
        calls: CircuitBreakingPublisher,
        capacity: usize,
    ) -> Self {
        Self {
            graph,
            calls,
            entities: LastKnownGood::with_capacity(capacity),
            pull_requests: LastKnownGood::with_capacity(capacity),
            no_matches: NeutralDefault(Vec::new()),
        }
    }

    /// Entity by kind and natural key.
    ///
    /// # Errors
    ///
    /// [`DependencyError`] when the graph fails and no fallback is cached.
    pub async fn entity(
        &self,
        kind: EntityKind,
        key: &NaturalKey,
    ) -> Result<Guarded<Option<EntityRecord>>, DependencyError> {
        let graph = self.graph.as_ref();
        let dependency = self.calls.dependency();
        let cache_key = (kind, key.clone());
        let cache: &dyn FallbackCache<(EntityKind, NaturalKey), Option<EntityRecord>> =
            &self.entities;
        self.calls
            .call_with_fallback(&cache_key, cache, move |_| async move {
                graph
                    .entity(kind, key)
                    .await
                    .map_err(|e| unavailable(dependency, e))
            })
            .await
    }

    /// A pull request with its outgoing edges and recorded evaluations.
    pub async fn pull_request(
        &self,
        repository: &RepositoryName,
        number: PullRequestNumber,
    ) -> Result<Guarded<Option<PullRequestView>>, DependencyError> {
        let graph = self.graph.as_ref();
        let dependency = self.calls.dependency();
        let key = NaturalKey::pull_request(repository, number);
        let key_ref = &key;
        let cache: &dyn FallbackCache<NaturalKey, Option<PullRequestView>> = &self.pull_requests;
        self.calls
            .call_with_fallback(&key, cache, move |_| {
                load_pull_request(graph, dependency, key_ref)
            })
            .await
    }

    /// Top-`limit` symbols most similar to `query`.
    pub async fn similar_symbols(
        &self,
        query: &Embedding,
        repository: Option<&RepositoryName>,
        limit: usize,
    ) -> Result<Guarded<Vec<SimilarEntity>>, DependencyError> {
        let graph = self.graph.as_ref();
        let dependency = self.calls.dependency();
        let cache: &dyn FallbackCache<(), Vec<SimilarEntity>> = &self.no_matches;
        self.calls
            .call_with_fallback(&(), cache, move |_| async move {
                graph
                    .nearest(EntityKind::Symbol, query, repository, limit)
                    .await
                    .map_err(|e| unavailable(dependency, e))
            })
            .await
    }
}

async fn load_pull_request(
    graph: &dyn KnowledgeGraph,
    dependency: &DependencyName,
    key: &NaturalKey,
) -> Result<Option<PullRequestView>, DependencyError> {
    let Some(pull_request) = graph
        .entity(EntityKind::PullRequest, key)
        .await
        .map_err(|e| unavailable(dependency, e))?
    else {
        return Ok(None);
    };
    let edges = graph
        .neighbors(pull_request.id, Direction::Outgoing, None)
        .await
        .map_err(|e| unavailable(dependency, e))?;
    let evaluations = graph
        .evaluations(key)
        .await
        .map_err(|e| unavailable(dependency, e))?;
    Ok(Some(PullRequestView {
        pull_request,
        edges,
        evaluations,
    }))
}
