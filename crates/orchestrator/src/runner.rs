//! Drives one run through its steps.
//!
//! Every step reads the last committed checkpoint, does its work, and commits
//! the next checkpoint with a compare-and-set on the state it started from.
//! Side effects are idempotent (graph upserts, publishes keyed by run id), so
//! a step interrupted after its effects but before its commit is simply
//! repeated on resume.
//!
//! The step timeout bounds the work only. The commit runs outside it: once a
//! checkpoint write has been issued, the runner waits for its outcome, and a
//! failed compare-and-set whose stored state already equals the step's target
//! is adopted as the step's result.

use std::sync::Arc;

use pipeline::{
    extract_facts, FactBundle, FailureKind, ImpactAnalysis, NaturalKey, PipelineError,
    RetryPolicy, RunCheckpoint, RunState, StorageError, Timestamp,
};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::orchestrator::Inner;
use crate::plan::{plan_graph_update, plan_policy_record};
use crate::serializer::Ticket;
use crate::slo::Alert;
use crate::summary::publish_request;

/// The unit of work that moves a run out of its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ExtractFacts,
    Analyze,
    UpdateGraph,
    EvaluatePolicy,
    Publish,
    Complete,
}

impl Step {
    fn after(state: RunState) -> Option<Step> {
        match state {
            RunState::Registered => Some(Step::ExtractFacts),
            RunState::FactsExtracted => Some(Step::Analyze),
            RunState::Analyzed => Some(Step::UpdateGraph),
            RunState::GraphUpdated => Some(Step::EvaluatePolicy),
            RunState::PolicyEvaluated => Some(Step::Publish),
            RunState::Published => Some(Step::Complete),
            RunState::Completed | RunState::Failed | RunState::Cancelled => None,
        }
    }

    fn target(self) -> RunState {
        match self {
            Step::ExtractFacts => RunState::FactsExtracted,
            Step::Analyze => RunState::Analyzed,
            Step::UpdateGraph => RunState::GraphUpdated,
            Step::EvaluatePolicy => RunState::PolicyEvaluated,
            Step::Publish => RunState::Published,
            Step::Complete => RunState::Completed,
        }
    }
}

fn failure_kind(err: &PipelineError) -> FailureKind {
    match err {
        PipelineError::MalformedEvent(_) => FailureKind::Malformed,
        PipelineError::Storage(_) => FailureKind::Storage,
        PipelineError::Dependency(_) => FailureKind::DependencyExhausted,
        PipelineError::StepTimeout { .. } => FailureKind::StepTimeout,
        PipelineError::RunTimeout { .. } => FailureKind::RunTimeout,
        PipelineError::Cancelled { .. } | PipelineError::Configuration { .. } => {
            FailureKind::Internal
        }
    }
}

/// Runs `checkpoint` to a terminal state and returns it.
///
/// Waits for `ticket` first, so runs sharing a key execute one at a time in
/// intake order. The run deadline starts once the run holds its key.
pub(crate) async fn drive(
    inner: Arc<Inner>,
    checkpoint: RunCheckpoint,
    ticket: Ticket,
) -> RunState {
    let span = info_span!(
        "run",
        run_id = %checkpoint.run_id,
        delivery_id = %checkpoint.delivery_id(),
        run_key = %checkpoint.run_key,
    );
    async move {
        let _turn = ticket.acquire().await;
        let deadline = Instant::now() + inner.settings.run_timeout;
        let mut checkpoint = checkpoint;

        while let Some(step) = Step::after(checkpoint.state) {
            if checkpoint.state < RunState::Published {
                if let Some(newer) = ticket.superseded_by() {
                    info!(superseded_by = %newer, state = %checkpoint.state, "Run superseded");
                    let from = checkpoint.state;
                    checkpoint.cancel(newer);
                    commit_terminal(&inner, &checkpoint, from).await;
                    break;
                }
            }

            let outcome = if Instant::now() >= deadline {
                Err(PipelineError::RunTimeout {
                    limit: inner.settings.run_timeout,
                })
            } else {
                run_step(&inner, &checkpoint, step, deadline).await
            };

            match outcome {
                Ok(next) => {
                    info!(from = %checkpoint.state, to = %next.state, "Run advanced");
                    checkpoint = next;
                }
                Err(err) => {
                    fail(&inner, &mut checkpoint, &err).await;
                    break;
                }
            }
        }

        inner.metrics.record_run(
            checkpoint.state,
            checkpoint.failure.as_ref().map(|f| f.kind),
        );
        checkpoint.state
    }
    .instrument(span)
    .await
}

async fn fail(inner: &Inner, checkpoint: &mut RunCheckpoint, err: &PipelineError) {
    let kind = failure_kind(err);
    let from = checkpoint.state;
    error!(state = %from, failure = kind.as_str(), error = %err, "Run failed");

    if let PipelineError::RunTimeout { limit } = err {
        inner.alerts.raise(Alert::RunTimedOut {
            run_id: checkpoint.run_id,
            run_key: checkpoint.run_key.clone(),
            state: from,
            limit: *limit,
        });
    }

    checkpoint.fail(kind, err.to_string());
    commit_terminal(inner, checkpoint, from).await;
}

/// Persists a terminal checkpoint. A failure here leaves the run resumable
/// from `from`; it is logged, not retried.
async fn commit_terminal(inner: &Inner, checkpoint: &RunCheckpoint, from: RunState) {
    if let Err(e) = inner.runs.save(checkpoint, from).await {
        error!(
            state = %checkpoint.state,
            error = %e,
            "Could not persist terminal run state; run will resume on restart"
        );
    }
}

/// Runs one step with timeout and retry.
async fn run_step(
    inner: &Inner,
    current: &RunCheckpoint,
    step: Step,
    deadline: Instant,
) -> Result<RunCheckpoint, PipelineError> {
    let settings = &inner.settings;
    let max_attempts = settings.max_step_attempts.max(1);
    let to = step.target();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let bounded_by_run = remaining <= settings.step_timeout;
        let limit = remaining.min(settings.step_timeout);

        let started = Instant::now();
        let result = match tokio::time::timeout(limit, perform(inner, current, step)).await {
            Ok(Ok(next)) => commit(inner, current, next).await,
            Ok(Err(err)) => Err(err),
            Err(_) if bounded_by_run => Err(PipelineError::RunTimeout {
                limit: settings.run_timeout,
            }),
            Err(_) => Err(PipelineError::StepTimeout {
                step: to.as_str().to_string(),
                elapsed: limit,
            }),
        };
        inner.metrics.record_step(to, started.elapsed());

        let err = match result {
            Ok(next) => return Ok(next),
            Err(err) => err,
        };
        let hint = match err.retry_policy() {
            RetryPolicy::Retryable { after } if attempt < max_attempts => after,
            _ => return Err(err),
        };
        let delay = settings.step_retry.delay_for_attempt(attempt - 1, hint);
        warn!(
            step = to.as_str(),
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Step failed, retrying"
        );
        tokio::time::sleep(delay.min(remaining)).await;
    }
}

fn facts_of(checkpoint: &RunCheckpoint) -> Result<&FactBundle, StorageError> {
    checkpoint
        .facts
        .as_ref()
        .ok_or_else(|| StorageError::corruption("run checkpoint without facts"))
}

fn analysis_of(checkpoint: &RunCheckpoint) -> Result<&ImpactAnalysis, StorageError> {
    checkpoint
        .analysis
        .as_ref()
        .ok_or_else(|| StorageError::corruption("run checkpoint without analysis"))
}

/// Commits `next` over `current`.
///
/// A rejected write is checked against the store: if the stored checkpoint
/// already holds `next.state`, an earlier attempt committed it and that
/// checkpoint is returned instead.
async fn commit(
    inner: &Inner,
    current: &RunCheckpoint,
    next: RunCheckpoint,
) -> Result<RunCheckpoint, PipelineError> {
    let err = match inner.runs.save(&next, current.state).await {
        Ok(()) => return Ok(next),
        Err(err) => err,
    };
    match inner.runs.load(current.run_id).await {
        Ok(Some(stored)) if stored.state == next.state => {
            warn!(state = %stored.state, error = %err, "Checkpoint already committed");
            Ok(stored)
        }
        Ok(_) => Err(err.into()),
        Err(reload) => {
            warn!(error = %reload, "Could not reload checkpoint after failed commit");
            Err(err.into())
        }
    }
}

/// One attempt of `step`'s work. Returns the advanced checkpoint, uncommitted.
async fn perform(
    inner: &Inner,
    current: &RunCheckpoint,
    step: Step,
) -> Result<RunCheckpoint, PipelineError> {
    let mut next = current.clone();

    match step {
        Step::ExtractFacts => {
            next.facts = Some(extract_facts(&next.delivery)?);
        }
        Step::Analyze => {
            let analysis = inner.analyzer.analyze(facts_of(&next)?).await;
            if analysis.analysis_incomplete {
                warn!(degradations = ?analysis.degradations, "Analysis incomplete");
            }
            next.analysis = Some(analysis);
        }
        Step::UpdateGraph => {
            let facts = facts_of(&next)?;
            let batch = plan_graph_update(facts, analysis_of(&next)?);
            let receipt = inner.graph.apply(&batch).await?;
            debug!(?receipt, "Graph updated");
            inner.health.schedule(&facts.repository.name);
        }
        Step::EvaluatePolicy => {
            let facts = facts_of(&next)?;
            let decision = inner.gate.evaluate(facts, analysis_of(&next)?).await;
            if let Some(decision) = &decision {
                if let Some(batch) = plan_policy_record(facts, decision, Timestamp::now()) {
                    inner.graph.apply(&batch).await?;
                }
                if decision.audit_fail_open {
                    if let Some(pr) = facts.pull_request() {
                        inner.alerts.raise(Alert::PolicyFailOpen {
                            run_id: next.run_id,
                            pull_request: NaturalKey::pull_request(&facts.repository.name, pr.number),
                        });
                    }
                }
            }
            next.decision = decision;
        }
        Step::Publish => {
            let request = publish_request(&next)?;
            let portal = inner.portal.as_ref();
            let request_ref = &request;
            let receipt = inner
                .portal_calls
                .call(move |_| portal.publish(request_ref))
                .await?;
            let fresh = inner
                .slo
                .record_publish(request.event_received_at, receipt.published_at);
            debug!(location = ?receipt.location, fresh, "Documentation published");
            next.publish = Some(receipt);
        }
        Step::Complete => {}
    }

    next.advance(step.target());
    Ok(next)
}
