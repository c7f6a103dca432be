//! Codex downstream adapters.
//!
//! Implements the collaborator ports defined in the [`pipeline`] crate
//! against real services:
//!
//! | Adapter | Port | Transport |
//! |---------|------|-----------|
//! | [`HttpPolicyEngine`] | `PolicyEngine` | OPA-style `POST {"input": ...}` |
//! | [`HttpDocumentationPortal`] | `DocumentationPortal` | `POST` with `Idempotency-Key` |
//! | [`HttpCoverageReporter`] | `CoverageReporter` | `GET /coverage/{owner}/{repo}/{sha}` |
//! | [`HttpRiskScorer`] | `RiskScorer` | `POST /score` |
//! | [`WorkspaceSnapshot`] | `SourceSnapshot` | local checkout on disk |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! Every adapter maps its transport failures onto
//! [`pipeline::DependencyError`] so that the circuit-breaking publisher can
//! decide what to retry; none of them retries on its own.

mod coverage;
mod http;
mod policy;
mod portal;
mod risk;
mod snapshot;

pub use coverage::HttpCoverageReporter;
pub use http::{classify_status, HttpClientConfig};
pub use policy::HttpPolicyEngine;
pub use portal::HttpDocumentationPortal;
pub use risk::HttpRiskScorer;
pub use snapshot::{scan_symbols, WorkspaceSnapshot, EMBEDDING_DIMENSIONS};
