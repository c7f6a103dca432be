//! Knowledge graph model and the [`KnowledgeGraph`] port.
//!
//! Entities are matched on `(kind, natural key)`; edges on
//! `(from, to, kind)`. All writes go through a [`GraphWriteBatch`], which the
//! store commits as one transaction: a batch either lands completely or not
//! at all, and every edge endpoint is upserted before the edge itself.
//!
//! ## Conflict policy
//!
//! Concurrent upserts of the same natural key serialise in the store; the
//! last writer wins per attribute key. Edges are monotonic: upserting an
//! existing edge is a no-op and edges are never retracted automatically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Embedding, EntityId, FilePath, PolicyId, PullRequestNumber, ReleaseTag, RepositoryName,
    StorageError, SymbolName, Timestamp,
};

// ---------------------------------------------------------------------------
// Entity and edge kinds
// ---------------------------------------------------------------------------

/// Entity kinds held by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A repository.
    Repository,
    /// A pull request.
    PullRequest,
    /// A file in a repository.
    File,
    /// A symbol defined in a file.
    Symbol,
    /// A governance policy.
    Policy,
    /// A release.
    Release,
    /// A user or team named in CODEOWNERS.
    Owner,
}

impl EntityKind {
    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Repository => "repository",
            EntityKind::PullRequest => "pull_request",
            EntityKind::File => "file",
            EntityKind::Symbol => "symbol",
            EntityKind::Policy => "policy",
            EntityKind::Release => "release",
            EntityKind::Owner => "owner",
        }
    }

    /// Parses a storage name.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "repository" => EntityKind::Repository,
            "pull_request" => EntityKind::PullRequest,
            "file" => EntityKind::File,
            "symbol" => EntityKind::Symbol,
            "policy" => EntityKind::Policy,
            "release" => EntityKind::Release,
            "owner" => EntityKind::Owner,
            _ => return None,
        })
    }
}

/// Relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Repository → PullRequest.
    HasPullRequest,
    /// Repository → Release.
    HasRelease,
    /// Repository → File.
    Contains,
    /// PullRequest → File.
    Touches,
    /// PullRequest → Symbol.
    Defines,
    /// PullRequest → Policy.
    GovernedBy,
    /// Symbol → Symbol.
    Calls,
    /// File → Owner.
    OwnedBy,
}

impl EdgeKind {
    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::HasPullRequest => "has_pull_request",
            EdgeKind::HasRelease => "has_release",
            EdgeKind::Contains => "contains",
            EdgeKind::Touches => "touches",
            EdgeKind::Defines => "defines",
            EdgeKind::GovernedBy => "governed_by",
            EdgeKind::Calls => "calls",
            EdgeKind::OwnedBy => "owned_by",
        }
    }

    /// Parses a storage name.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "has_pull_request" => EdgeKind::HasPullRequest,
            "has_release" => EdgeKind::HasRelease,
            "contains" => EdgeKind::Contains,
            "touches" => EdgeKind::Touches,
            "defines" => EdgeKind::Defines,
            "governed_by" => EdgeKind::GovernedBy,
            "calls" => EdgeKind::Calls,
            "owned_by" => EdgeKind::OwnedBy,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Natural keys
// ---------------------------------------------------------------------------

/// Business-meaningful unique key of an entity within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Wraps a pre-formatted key.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `"owner/repo"`.
    pub fn repository(repo: &RepositoryName) -> Self {
        Self(repo.to_string())
    }

    /// `"owner/repo#42"`.
    pub fn pull_request(repo: &RepositoryName, number: PullRequestNumber) -> Self {
        Self(format!("{repo}#{number}"))
    }

    /// `"owner/repo:path/to/file.rs"`.
    pub fn file(repo: &RepositoryName, path: &FilePath) -> Self {
        Self(format!("{repo}:{path}"))
    }

    /// `"owner/repo:path/to/file.rs#name"`, unique per (repo, name, file).
    pub fn symbol(repo: &RepositoryName, path: &FilePath, name: &SymbolName) -> Self {
        Self(format!("{repo}:{path}#{name}"))
    }

    /// Policies are global: `"policy-id"`.
    pub fn policy(policy: &PolicyId) -> Self {
        Self(policy.to_string())
    }

    /// `"owner/repo!v1.2.3"`.
    pub fn release(repo: &RepositoryName, tag: &ReleaseTag) -> Self {
        Self(format!("{repo}!{tag}"))
    }

    /// Owners are global: `"@org/team"` or `"@user"`.
    pub fn owner(handle: &str) -> Self {
        Self(format!("@{handle}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Write batches
// ---------------------------------------------------------------------------

/// Index of an entity upsert within a [`GraphWriteBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef(usize);

impl EntityRef {
    /// Position in the batch.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Entity upsert: insert if absent, merge attributes if present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpsert {
    /// Entity kind.
    pub kind: EntityKind,
    /// Natural key.
    pub key: NaturalKey,
    /// Owning repository, used for scoping queries and stale marking.
    pub repository: Option<RepositoryName>,
    /// File path, for file and symbol entities.
    pub file_path: Option<FilePath>,
    /// Attributes merged over existing ones (top-level keys, last writer wins).
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Replaces the stored embedding when present.
    pub embedding: Option<Embedding>,
}

impl EntityUpsert {
    /// An upsert with no scope, attributes, or embedding.
    pub fn new(kind: EntityKind, key: NaturalKey) -> Self {
        Self {
            kind,
            key,
            repository: None,
            file_path: None,
            attributes: serde_json::Map::new(),
            embedding: None,
        }
    }

    /// Scopes the entity to a repository.
    pub fn in_repository(mut self, repository: &RepositoryName) -> Self {
        self.repository = Some(repository.clone());
        self
    }

    /// Records the file the entity lives in.
    pub fn at_path(mut self, path: &FilePath) -> Self {
        self.file_path = Some(path.clone());
        self
    }

    /// Sets one attribute.
    pub fn attr(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Replaces the embedding when `embedding` is present.
    pub fn with_embedding(mut self, embedding: Option<Embedding>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Edge upsert between two entities of the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeUpsert {
    /// Source entity.
    pub from: EntityRef,
    /// Target entity.
    pub to: EntityRef,
    /// Relationship kind.
    pub kind: EdgeKind,
}

/// Marks every entity of the given kinds under a file path stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleMark {
    /// Repository scope.
    pub repository: RepositoryName,
    /// Removed file.
    pub file_path: FilePath,
}

/// Outcome of one policy for one pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    /// Policy allowed the change.
    Allow,
    /// Policy denied the change.
    Deny,
}

impl EvaluationResult {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationResult::Allow => "allow",
            EvaluationResult::Deny => "deny",
        }
    }
}

/// Recorded policy decision, unique per `(pull request, policy)`; a new
/// evaluation overwrites the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    /// Pull request natural key.
    pub pull_request: NaturalKey,
    /// Evaluated policy.
    pub policy_id: PolicyId,
    /// Decision.
    pub result: EvaluationResult,
    /// Reason given (or the fallback reason when the engine was unavailable).
    pub reason: String,
    /// When the decision was made.
    pub evaluated_at: Timestamp,
}

/// A set of graph writes committed as one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphWriteBatch {
    entities: Vec<EntityUpsert>,
    edges: Vec<EdgeUpsert>,
    stale: Vec<StaleMark>,
    evaluations: Vec<PolicyEvaluation>,
}

impl GraphWriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an entity upsert and returns a reference for edges.
    ///
    /// Upserting the same `(kind, key)` twice in one batch returns the first
    /// reference with the attributes merged.
    pub fn upsert_entity(&mut self, upsert: EntityUpsert) -> EntityRef {
        if let Some(pos) = self
            .entities
            .iter()
            .position(|e| e.kind == upsert.kind && e.key == upsert.key)
        {
            let existing = &mut self.entities[pos];
            existing.attributes.extend(upsert.attributes);
            if upsert.embedding.is_some() {
                existing.embedding = upsert.embedding;
            }
            return EntityRef(pos);
        }
        self.entities.push(upsert);
        EntityRef(self.entities.len() - 1)
    }

    /// Queues an edge upsert. Duplicate edges within a batch are dropped.
    pub fn upsert_edge(&mut self, from: EntityRef, to: EntityRef, kind: EdgeKind) {
        let edge = EdgeUpsert { from, to, kind };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Queues a stale mark for a removed file and its symbols.
    pub fn mark_stale(&mut self, repository: RepositoryName, file_path: FilePath) {
        self.stale.push(StaleMark {
            repository,
            file_path,
        });
    }

    /// Queues a policy evaluation record.
    pub fn record_evaluation(&mut self, evaluation: PolicyEvaluation) {
        self.evaluations.push(evaluation);
    }

    /// Queued entity upserts, in order.
    pub fn entities(&self) -> &[EntityUpsert] {
        &self.entities
    }

    /// Queued edge upserts, in order.
    pub fn edges(&self) -> &[EdgeUpsert] {
        &self.edges
    }

    /// Queued stale marks.
    pub fn stale_marks(&self) -> &[StaleMark] {
        &self.stale
    }

    /// Queued policy evaluations.
    pub fn evaluations(&self) -> &[PolicyEvaluation] {
        &self.evaluations
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.edges.is_empty()
            && self.stale.is_empty()
            && self.evaluations.is_empty()
    }
}

/// Ids assigned to a batch's entities, in batch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphWriteReceipt {
    /// One id per queued entity.
    pub entity_ids: Vec<EntityId>,
    /// Edges that did not exist before this batch.
    pub edges_created: usize,
}

// ---------------------------------------------------------------------------
// Read model
// ---------------------------------------------------------------------------

/// Stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Surrogate id.
    pub id: EntityId,
    /// Kind.
    pub kind: EntityKind,
    /// Natural key.
    pub key: NaturalKey,
    /// Owning repository, if scoped.
    pub repository: Option<RepositoryName>,
    /// File path, for files and symbols.
    pub file_path: Option<FilePath>,
    /// Merged attributes.
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// True when the backing file was removed.
    pub stale: bool,
    /// Last write time.
    pub updated_at: Timestamp,
}

impl EntityRecord {
    /// Reads a numeric attribute.
    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(|v| v.as_f64())
    }

    /// Reads a string attribute.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// Edge direction for traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges leaving the entity.
    Outgoing,
    /// Edges arriving at the entity.
    Incoming,
}

/// One hop of a traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Relationship kind.
    pub edge: EdgeKind,
    /// Entity at the other end.
    pub entity: EntityRecord,
}

/// Nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEntity {
    /// Matched entity.
    pub entity: EntityRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Aggregate counts, for tests and operator summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of entities.
    pub entities: u64,
    /// Number of edges.
    pub edges: u64,
    /// Number of policy evaluations.
    pub evaluations: u64,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Shared knowledge graph store. Single source of truth for entity state.
///
/// The read surface is also what the external graph query API exposes; the
/// write surface ([`KnowledgeGraph::apply`]) is internal only.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    /// Commits a batch as one transaction.
    async fn apply(&self, batch: &GraphWriteBatch) -> Result<GraphWriteReceipt, StorageError>;

    /// Looks up an entity by kind and natural key.
    async fn entity(
        &self,
        kind: EntityKind,
        key: &NaturalKey,
    ) -> Result<Option<EntityRecord>, StorageError>;

    /// Every non-stale entity of `kind` scoped to `repository`.
    async fn entities_in(
        &self,
        kind: EntityKind,
        repository: &RepositoryName,
    ) -> Result<Vec<EntityRecord>, StorageError>;

    /// Lists entities adjacent to `id`, optionally filtered by edge kind.
    async fn neighbors(
        &self,
        id: EntityId,
        direction: Direction,
        edge: Option<EdgeKind>,
    ) -> Result<Vec<Neighbor>, StorageError>;

    /// Top-`limit` entities of `kind` by cosine similarity to `query`,
    /// optionally scoped to one repository. Stale entities are excluded.
    async fn nearest(
        &self,
        kind: EntityKind,
        query: &Embedding,
        repository: Option<&RepositoryName>,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, StorageError>;

    /// Policy evaluations recorded for a pull request.
    async fn evaluations(
        &self,
        pull_request: &NaturalKey,
    ) -> Result<Vec<PolicyEvaluation>, StorageError>;

    /// Entity, edge, and evaluation counts.
    async fn stats(&self) -> Result<GraphStats, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepositoryName {
        RepositoryName::new("acme/widgets").unwrap()
    }

    fn upsert(kind: EntityKind, key: &str, attr: (&str, i64)) -> EntityUpsert {
        let mut attributes = serde_json::Map::new();
        attributes.insert(attr.0.to_string(), attr.1.into());
        EntityUpsert {
            kind,
            key: NaturalKey::from_raw(key),
            repository: Some(repo()),
            file_path: None,
            attributes,
            embedding: None,
        }
    }

    #[test]
    fn natural_keys_are_scoped_by_repository() {
        let path = FilePath::new("src/lib.rs").unwrap();
        let name = SymbolName::new("parse").unwrap();
        assert_eq!(NaturalKey::pull_request(&repo(), PullRequestNumber::new(3)).as_str(), "acme/widgets#3");
        assert_eq!(NaturalKey::file(&repo(), &path).as_str(), "acme/widgets:src/lib.rs");
        assert_eq!(
            NaturalKey::symbol(&repo(), &path, &name).as_str(),
            "acme/widgets:src/lib.rs#parse"
        );
    }

    #[test]
    fn batch_merges_repeated_entities_and_edges() {
        let mut batch = GraphWriteBatch::new();
        let a = batch.upsert_entity(upsert(EntityKind::File, "f", ("x", 1)));
        let b = batch.upsert_entity(upsert(EntityKind::Symbol, "s", ("y", 2)));
        let a_again = batch.upsert_entity(upsert(EntityKind::File, "f", ("z", 3)));
        batch.upsert_edge(a, b, EdgeKind::Calls);
        batch.upsert_edge(a_again, b, EdgeKind::Calls);

        assert_eq!(a, a_again);
        assert_eq!(batch.entities().len(), 2);
        assert_eq!(batch.entities()[0].attributes.len(), 2);
        assert_eq!(batch.edges().len(), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn kinds_round_trip_through_storage_names() {
        for kind in [
            EntityKind::Repository,
            EntityKind::PullRequest,
            EntityKind::File,
            EntityKind::Symbol,
            EntityKind::Policy,
            EntityKind::Release,
            EntityKind::Owner,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse("governed_by"), Some(EdgeKind::GovernedBy));
        assert_eq!(EdgeKind::parse("owned_by"), Some(EdgeKind::OwnedBy));
        assert_eq!(EdgeKind::parse("retracted"), None);
    }
}
