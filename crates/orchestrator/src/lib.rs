//! Codex pipeline orchestration.
//!
//! Sequences every accepted delivery through the durable run state machine:
//!
//! ```text
//! Registered → FactsExtracted → Analyzed → GraphUpdated
//!            → PolicyEvaluated → Published → Completed
//! ```
//!
//! Each transition is checkpointed before the next step starts, so a
//! restarted process resumes at the first uncommitted step.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Depends on the [`pipeline`] ports and the
//! [`resilience`] wrappers only; concrete stores and HTTP adapters are
//! injected by the composition root.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`orchestrator`] | `Orchestrator` builder, intake, resume, shutdown |
//! | `runner` | Step executor: timeouts, step retries, checkpointing |
//! | [`analyzer`] | Impact Analyzer with time bound and degradation |
//! | [`gate`] | Policy Gate and the named failure mode |
//! | [`plan`] | Graph write planning from facts and analysis |
//! | [`serializer`] | Per-key run serialisation and supersede detection |
//! | [`health`] | Asynchronous repository health recomputation |
//! | [`query`] | Read-side graph queries behind a circuit breaker |
//! | [`slo`] | Docs-freshness SLO monitor and alert sinks |
//! | [`metrics`] | OpenTelemetry instruments plus an in-process snapshot |
//! | [`summary`] | Documentation page rendering |
//! | [`dependencies`] | Names of guarded downstream dependencies |
//! | [`settings`] | Tunables for the components above |

pub mod analyzer;
pub mod dependencies;
pub mod gate;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod query;
mod runner;
pub mod serializer;
pub mod settings;
pub mod slo;
pub mod summary;

pub use analyzer::ImpactAnalyzer;
pub use gate::PolicyGate;
pub use health::{health_score, HealthRecomputer};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{
    Collaborators, IntakeOutcome, IntakeSummary, Orchestrator, OrchestratorBuilder, RunHandle,
    Stores,
};
pub use plan::{plan_graph_update, plan_policy_record};
pub use query::{GraphQueryService, PullRequestView};
pub use serializer::{KeyedSerializer, Ticket};
pub use settings::{AnalyzerSettings, GateSettings, OrchestratorSettings};
pub use slo::{Alert, AlertSink, LogAlertSink, SloMonitor, SloSettings};
