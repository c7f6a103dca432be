//! Run state machine, durable checkpoints, and the [`RunStore`] port.
//!
//! ```text
//! Registered → FactsExtracted → Analyzed → GraphUpdated
//!            → PolicyEvaluated → Published → Completed
//!
//! any non-terminal state → Failed | Cancelled
//! ```
//!
//! A checkpoint is written after every transition together with everything
//! accumulated so far, so a restarted process resumes at the first step that
//! has not committed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Decision, Delivery, DeliveryId, FactBundle, ImpactAnalysis, PublishReceipt, RunId, RunKey,
    StorageError, Timestamp,
};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Delivery accepted; nothing else done.
    Registered,
    /// Fact bundle extracted.
    FactsExtracted,
    /// Impact analysis done (possibly partial).
    Analyzed,
    /// Graph writes committed.
    GraphUpdated,
    /// Policy decision recorded (or skipped for non-PR runs).
    PolicyEvaluated,
    /// Documentation published.
    Published,
    /// Finished.
    Completed,
    /// Terminal failure.
    Failed,
    /// Superseded by a newer run for the same key.
    Cancelled,
}

impl RunState {
    /// The state reached by running the next step, or `None` when terminal.
    pub fn next(self) -> Option<RunState> {
        match self {
            RunState::Registered => Some(RunState::FactsExtracted),
            RunState::FactsExtracted => Some(RunState::Analyzed),
            RunState::Analyzed => Some(RunState::GraphUpdated),
            RunState::GraphUpdated => Some(RunState::PolicyEvaluated),
            RunState::PolicyEvaluated => Some(RunState::Published),
            RunState::Published => Some(RunState::Completed),
            RunState::Completed | RunState::Failed | RunState::Cancelled => None,
        }
    }

    /// True for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Registered => "registered",
            RunState::FactsExtracted => "facts_extracted",
            RunState::Analyzed => "analyzed",
            RunState::GraphUpdated => "graph_updated",
            RunState::PolicyEvaluated => "policy_evaluated",
            RunState::Published => "published",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    /// Parses a storage name.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "registered" => RunState::Registered,
            "facts_extracted" => RunState::FactsExtracted,
            "analyzed" => RunState::Analyzed,
            "graph_updated" => RunState::GraphUpdated,
            "policy_evaluated" => RunState::PolicyEvaluated,
            "published" => RunState::Published,
            "completed" => RunState::Completed,
            "failed" => RunState::Failed,
            "cancelled" => RunState::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The payload could not be normalised.
    Malformed,
    /// A dependency kept failing after retries.
    DependencyExhausted,
    /// A step kept timing out.
    StepTimeout,
    /// The run exceeded its overall time limit.
    RunTimeout,
    /// Persisted state could not be read or written.
    Storage,
    /// The run reached a state its own rules do not allow.
    Internal,
}

impl FailureKind {
    /// Stable lowercase name, used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Malformed => "malformed",
            FailureKind::DependencyExhausted => "dependency_exhausted",
            FailureKind::StepTimeout => "step_timeout",
            FailureKind::RunTimeout => "run_timeout",
            FailureKind::Storage => "storage",
            FailureKind::Internal => "internal",
        }
    }
}

/// Terminal failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Error text.
    pub message: String,
    /// State the run was in when it failed.
    pub at: RunState,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Run id.
    pub run_id: RunId,
    /// Serialisation key.
    pub run_key: RunKey,
    /// Current state.
    pub state: RunState,
    /// The delivery that started the run (kept for re-extraction on resume).
    pub delivery: Delivery,
    /// Set from `FactsExtracted` on.
    pub facts: Option<FactBundle>,
    /// Set from `Analyzed` on.
    pub analysis: Option<ImpactAnalysis>,
    /// Set at `PolicyEvaluated` for pull request runs.
    pub decision: Option<Decision>,
    /// Set from `Published` on.
    pub publish: Option<PublishReceipt>,
    /// Set when `Failed`.
    pub failure: Option<RunFailure>,
    /// Delivery that superseded this run, when `Cancelled`.
    pub superseded_by: Option<DeliveryId>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last transition time.
    pub updated_at: Timestamp,
}

impl RunCheckpoint {
    /// A fresh `Registered` checkpoint.
    pub fn registered(run_id: RunId, run_key: RunKey, delivery: Delivery) -> Self {
        let now = Timestamp::now();
        Self {
            run_id,
            run_key,
            state: RunState::Registered,
            delivery,
            facts: None,
            analysis: None,
            decision: None,
            publish: None,
            failure: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Delivery id of the triggering delivery.
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery.delivery_id
    }

    /// True once the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves to `state`, stamping the transition time.
    pub fn advance(&mut self, state: RunState) {
        self.state = state;
        self.updated_at = Timestamp::now();
    }

    /// Moves to `Failed`.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.failure = Some(RunFailure {
            kind,
            message: message.into(),
            at: self.state,
        });
        self.advance(RunState::Failed);
    }

    /// Moves to `Cancelled`.
    pub fn cancel(&mut self, superseded_by: DeliveryId) {
        self.superseded_by = Some(superseded_by);
        self.advance(RunState::Cancelled);
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Durable run state.
///
/// New runs are created by [`crate::DeliveryLedger::register`]; this port only
/// reads and advances them.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Loads a run.
    async fn load(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StorageError>;

    /// Persists `checkpoint` if the stored state is still `expected`.
    ///
    /// Returns [`StorageError::Conflict`] when another writer has moved the
    /// run on; the caller must reload rather than overwrite.
    async fn save(
        &self,
        checkpoint: &RunCheckpoint,
        expected: RunState,
    ) -> Result<(), StorageError>;

    /// Every run not yet in a terminal state, oldest first.
    async fn unfinished(&self) -> Result<Vec<RunCheckpoint>, StorageError>;

    /// The run started by a delivery.
    async fn by_delivery(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<RunCheckpoint>, StorageError>;
}
