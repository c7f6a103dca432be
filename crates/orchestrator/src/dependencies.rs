//! Names of the downstream dependencies guarded by circuit breakers.
//!
//! Breaker state is keyed by these names, so every caller of one dependency
//! shares one breaker.

use pipeline::DependencyName;

pub const SOURCE_SNAPSHOT: &str = "source-snapshot";
pub const COVERAGE: &str = "coverage";
pub const RISK_SCORER: &str = "risk-scorer";
pub const POLICY_ENGINE: &str = "policy-engine";
pub const DOCS_PORTAL: &str = "docs-portal";
pub const GRAPH_QUERY: &str = "graph-query";

/// [`DependencyName`] for one of the constants above.
pub fn name(dependency: &'static str) -> DependencyName {
    DependencyName::from_static(dependency)
}
