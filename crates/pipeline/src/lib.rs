//! Core ingestion domain for Codex.
//!
//! This crate contains every domain concept, newtype identifier, shared
//! primitive type, and cross-cutting error type used throughout the event
//! pipeline. Infrastructure crates implement the traits defined here; they
//! never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`DeliveryId`, `RunId`, etc.) |
//! | [`types`] | Shared value types (`RiskScore`, `Embedding`, `Timestamp`, etc.) |
//! | [`errors`] | Error taxonomy and retry-policy types |
//! | [`delivery`] | Delivery envelope, run key, `EventSource` port |
//! | [`facts`] | Fact bundle and the fact extractor |
//! | [`analysis`] | Impact-analysis types, collaborator ports, heuristic risk scorer |
//! | [`graph`] | Knowledge graph model and `KnowledgeGraph` port |
//! | [`ledger`] | `DeliveryLedger` port |
//! | [`ownership`] | CODEOWNERS parsing and path ownership |
//! | [`run`] | Run state machine and `RunStore` port |
//! | [`policy`] | Policy decisions and `PolicyEngine` port |
//! | [`publish`] | `DocumentationPortal` port |
//! | [`redact`] | Credential scrubbing for published text |

pub mod analysis;
pub mod delivery;
pub mod errors;
pub mod facts;
pub mod graph;
pub mod identifiers;
pub mod ledger;
pub mod ownership;
pub mod policy;
pub mod publish;
pub mod redact;
pub mod run;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use analysis::{
    CoverageReporter, HeuristicRiskScorer, ImpactAnalysis, RiskInput, RiskScorer,
    SizeCategory, SourceSnapshot, SymbolFacts, SymbolRef, SymbolType,
};
pub use delivery::{Delivery, EventKind, EventSource, RunKey, SubjectKey};
pub use errors::{DependencyError, MalformedEvent, PipelineError, RetryPolicy, StorageError};
pub use facts::{
    derive_run_key, extract_facts, ChangedFile, FactBundle, FileStatus, PullRequestAction,
    PullRequestFacts, PullRequestState, PushFacts, ReleaseFacts, RepositoryFacts, Subject,
};
pub use graph::{
    Direction, EdgeKind, EdgeUpsert, EntityKind, EntityRecord, EntityRef, EntityUpsert,
    EvaluationResult, GraphStats, GraphWriteBatch, GraphWriteReceipt, KnowledgeGraph,
    NaturalKey, Neighbor, PolicyEvaluation, SimilarEntity, StaleMark,
};
pub use identifiers::{
    CommitSha, DeliveryId, DependencyName, EntityId, FilePath, GitRef, Login, PolicyId,
    PullRequestNumber, ReleaseTag, RepositoryName, RunId, SymbolName,
};
pub use ledger::{DeliveryLedger, DeliveryOutcome, DeliveryRecord, RegisterOutcome};
pub use policy::{
    Decision, PolicyEngine, PolicyFailureMode, PolicyInput, PolicyResult, Verdict,
    POLICY_ENGINE_UNAVAILABLE,
};
pub use ownership::{CodeOwners, FileOwnership, Owner, OwnerKind, OwnershipRule, CODEOWNERS_LOCATIONS};
pub use publish::{DocumentationPortal, PublishReceipt, PublishRequest};
pub use redact::redact_secrets;
pub use run::{FailureKind, RunCheckpoint, RunFailure, RunState, RunStore};
pub use types::{ComplexityScore, Embedding, HealthScore, RiskScore, Timestamp};
