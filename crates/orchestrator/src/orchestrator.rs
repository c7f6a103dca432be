//! The pipeline orchestrator: intake, run scheduling, resume and shutdown.
//!
//! Intake derives the run key, registers the delivery in the ledger, and
//! spawns the run. Deduplication happens only in the ledger; the
//! orchestrator acts on what `register` returns. Every accepted run is
//! entered into the [`KeyedSerializer`] before it is spawned, so supersede
//! order follows intake order.

use std::sync::Arc;

use pipeline::{
    derive_run_key, CoverageReporter, Delivery, DeliveryLedger, DeliveryRecord,
    DocumentationPortal, EventSource, KnowledgeGraph, MalformedEvent, PipelineError,
    PolicyEngine, RegisterOutcome, RiskScorer, RunCheckpoint, RunId, RunState, RunStore,
    SourceSnapshot,
};
use resilience::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreakingPublisher, RetryConfig};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::analyzer::{Guard, ImpactAnalyzer};
use crate::dependencies::{self, name};
use crate::gate::PolicyGate;
use crate::health::HealthRecomputer;
use crate::metrics::{DeliveryLabel, PipelineMetrics};
use crate::query::GraphQueryService;
use crate::runner;
use crate::serializer::KeyedSerializer;
use crate::settings::{AnalyzerSettings, GateSettings, OrchestratorSettings};
use crate::slo::{AlertSink, LogAlertSink, SloMonitor, SloSettings};

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// The durable stores a pipeline runs against.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn DeliveryLedger>,
    pub runs: Arc<dyn RunStore>,
    pub graph: Arc<dyn KnowledgeGraph>,
}

impl Stores {
    /// All three ports served by one store.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: DeliveryLedger + RunStore + KnowledgeGraph + 'static,
    {
        Self {
            ledger: Arc::clone(&store) as Arc<dyn DeliveryLedger>,
            runs: Arc::clone(&store) as Arc<dyn RunStore>,
            graph: store,
        }
    }
}

/// External collaborators. Each call to them goes through its dependency's
/// breaker.
#[derive(Clone)]
pub struct Collaborators {
    pub snapshot: Arc<dyn SourceSnapshot>,
    pub coverage: Option<Arc<dyn CoverageReporter>>,
    pub risk_scorer: Arc<dyn RiskScorer>,
    pub policy_engine: Arc<dyn PolicyEngine>,
    pub portal: Arc<dyn DocumentationPortal>,
}

/// Shared state of every run task.
pub(crate) struct Inner {
    pub(crate) runs: Arc<dyn RunStore>,
    pub(crate) graph: Arc<dyn KnowledgeGraph>,
    pub(crate) analyzer: ImpactAnalyzer,
    pub(crate) gate: PolicyGate,
    pub(crate) portal: Arc<dyn DocumentationPortal>,
    pub(crate) portal_calls: CircuitBreakingPublisher,
    pub(crate) health: HealthRecomputer,
    pub(crate) slo: SloMonitor,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) settings: OrchestratorSettings,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures an [`Orchestrator`]. Every setting has a default; see
/// [`Orchestrator::builder`].
pub struct OrchestratorBuilder {
    stores: Stores,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    analyzer: AnalyzerSettings,
    gate: GateSettings,
    breaker: BreakerConfig,
    retry: RetryConfig,
    slo: SloSettings,
    alerts: Arc<dyn AlertSink>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl OrchestratorBuilder {
    /// Step and run time bounds plus the step retry budget.
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Analysis deadline, incomplete-analysis risk floor, and owner lookup.
    pub fn analyzer(mut self, settings: AnalyzerSettings) -> Self {
        self.analyzer = settings;
        self
    }

    /// Policy failure mode and the default policy.
    pub fn gate(mut self, settings: GateSettings) -> Self {
        self.gate = settings;
        self
    }

    /// Breaker thresholds shared by every dependency.
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Retry schedule for calls to external dependencies.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Freshness target and objective for the SLO monitor.
    pub fn slo(mut self, settings: SloSettings) -> Self {
        self.slo = settings;
        self
    }

    /// Where SLO breach alerts go. Defaults to the log.
    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Shares a metrics handle with the caller. Without one, metrics are
    /// recorded against a no-op meter.
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assembles the orchestrator. Must run inside a Tokio runtime (the
    /// health recomputer is spawned here).
    pub fn build(self) -> Orchestrator {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(PipelineMetrics::noop()));
        let breakers = Arc::new(
            BreakerRegistry::new(self.breaker)
                .with_observer(Arc::clone(&metrics) as Arc<dyn resilience::TransitionObserver>),
        );
        let publisher = |dependency: &'static str| {
            CircuitBreakingPublisher::new(
                breakers.breaker(&name(dependency)),
                self.retry.clone(),
            )
        };

        let collaborators = self.collaborators;
        let analyzer = ImpactAnalyzer::new(
            Guard::new(collaborators.snapshot, publisher(dependencies::SOURCE_SNAPSHOT)),
            collaborators
                .coverage
                .map(|coverage| Guard::new(coverage, publisher(dependencies::COVERAGE))),
            Guard::new(collaborators.risk_scorer, publisher(dependencies::RISK_SCORER)),
            self.analyzer,
        );
        let gate = PolicyGate::new(
            collaborators.policy_engine,
            publisher(dependencies::POLICY_ENGINE),
            self.gate,
            Arc::clone(&metrics),
        );
        let portal_calls = publisher(dependencies::DOCS_PORTAL);

        let inner = Inner {
            runs: self.stores.runs,
            graph: Arc::clone(&self.stores.graph),
            analyzer,
            gate,
            portal: collaborators.portal,
            portal_calls,
            health: HealthRecomputer::spawn(Arc::clone(&self.stores.graph)),
            slo: SloMonitor::new(self.slo, Arc::clone(&self.alerts), Arc::clone(&metrics)),
            alerts: self.alerts,
            metrics,
            settings: self.settings,
        };

        Orchestrator {
            inner: Arc::new(inner),
            ledger: self.stores.ledger,
            breakers,
            retry: self.retry,
            serializer: KeyedSerializer::new(),
            in_flight: Arc::new(watch::channel(0usize).0),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake results
// ---------------------------------------------------------------------------

/// A spawned run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    /// The run this handle drives.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Waits for the run to stop and returns its final state.
    ///
    /// # Errors
    ///
    /// [`JoinError`] when the task was aborted or panicked.
    pub async fn wait(self) -> Result<RunState, JoinError> {
        self.task.await
    }

    /// Stops the run where it is. Whatever was checkpointed stays, so the
    /// run resumes from there on the next start.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// What intake did with one delivery.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// First sighting; the run is executing.
    Accepted(RunHandle),
    /// Already seen; acknowledged and ignored.
    Duplicate(DeliveryRecord),
    /// Malformed; recorded and never run.
    Rejected(MalformedEvent),
}

/// Counts from [`Orchestrator::consume`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntakeSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Items the source could not frame as deliveries.
    pub unreadable: usize,
    /// Deliveries not registered because the ledger failed; left to upstream
    /// redelivery.
    pub intake_errors: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Keeps the in-flight count while a run task lives.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    ledger: Arc<dyn DeliveryLedger>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryConfig,
    serializer: KeyedSerializer,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Orchestrator {
    /// Starts a builder with default settings, the log alert sink, and no
    /// shared metrics handle.
    pub fn builder(stores: Stores, collaborators: Collaborators) -> OrchestratorBuilder {
        OrchestratorBuilder {
            stores,
            collaborators,
            settings: OrchestratorSettings::default(),
            analyzer: AnalyzerSettings::default(),
            gate: GateSettings::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            slo: SloSettings::default(),
            alerts: Arc::new(LogAlertSink),
            metrics: None,
        }
    }

    /// Accepts one delivery.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Storage`] when the ledger could not record the
    /// delivery. Nothing was written and no run started; the delivery must
    /// be redelivered.
    pub async fn submit(&self, delivery: Delivery) -> Result<IntakeOutcome, PipelineError> {
        let run_key = match derive_run_key(&delivery) {
            Ok(key) => key,
            Err(malformed) => return self.reject(delivery, malformed).await,
        };

        match self.ledger.register(&delivery, &run_key).await? {
            RegisterOutcome::Accepted(checkpoint) => {
                self.inner.metrics.record_delivery(DeliveryLabel::Accepted);
                info!(
                    delivery_id = %delivery.delivery_id,
                    run_id = %checkpoint.run_id,
                    run_key = %run_key,
                    event = %delivery.event,
                    "Delivery accepted"
                );
                Ok(IntakeOutcome::Accepted(self.start(checkpoint)))
            }
            RegisterOutcome::Duplicate(record) | RegisterOutcome::Rejected(record) => {
                self.inner.metrics.record_delivery(DeliveryLabel::Duplicate);
                debug!(delivery_id = %delivery.delivery_id, "Duplicate delivery acknowledged");
                Ok(IntakeOutcome::Duplicate(record))
            }
        }
    }

    async fn reject(
        &self,
        delivery: Delivery,
        malformed: MalformedEvent,
    ) -> Result<IntakeOutcome, PipelineError> {
        match self.ledger.reject(&delivery, &malformed).await? {
            RegisterOutcome::Duplicate(record) => {
                self.inner.metrics.record_delivery(DeliveryLabel::Duplicate);
                debug!(delivery_id = %delivery.delivery_id, "Duplicate malformed delivery acknowledged");
                Ok(IntakeOutcome::Duplicate(record))
            }
            RegisterOutcome::Rejected(_) | RegisterOutcome::Accepted(_) => {
                self.inner.metrics.record_delivery(DeliveryLabel::Rejected);
                warn!(
                    delivery_id = %delivery.delivery_id,
                    event = %delivery.event,
                    field = %malformed.field,
                    reason = %malformed.reason,
                    "Malformed delivery rejected"
                );
                Ok(IntakeOutcome::Rejected(malformed))
            }
        }
    }

    fn start(&self, checkpoint: RunCheckpoint) -> RunHandle {
        let ticket = self
            .serializer
            .enter(&checkpoint.run_key, checkpoint.delivery_id());
        let run_id = checkpoint.run_id;
        let in_flight = InFlight::enter(&self.in_flight);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            runner::drive(inner, checkpoint, ticket).await
        });
        RunHandle { run_id, task }
    }

    /// Restarts every run that has not reached a terminal state, oldest
    /// first. Each resumes at its first uncommitted step.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Storage`] when unfinished runs cannot be listed.
    pub async fn resume_pending(&self) -> Result<Vec<RunHandle>, PipelineError> {
        let pending = self.inner.runs.unfinished().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Resuming unfinished runs");
        }
        Ok(pending
            .into_iter()
            .map(|checkpoint| {
                debug!(run_id = %checkpoint.run_id, state = %checkpoint.state, "Resuming run");
                self.start(checkpoint)
            })
            .collect())
    }

    /// Submits every delivery from `source` until it ends. Runs keep
    /// executing afterwards; call [`shutdown`](Self::shutdown) to wait.
    pub async fn consume<S>(&self, source: &mut S) -> IntakeSummary
    where
        S: EventSource + ?Sized,
    {
        let mut summary = IntakeSummary::default();
        while let Some(item) = source.next_delivery().await {
            let delivery = match item {
                Ok(delivery) => delivery,
                Err(malformed) => {
                    summary.unreadable += 1;
                    warn!(field = %malformed.field, reason = %malformed.reason, "Unreadable delivery skipped");
                    continue;
                }
            };
            let delivery_id = delivery.delivery_id.clone();
            match self.submit(delivery).await {
                Ok(IntakeOutcome::Accepted(_)) => summary.accepted += 1,
                Ok(IntakeOutcome::Duplicate(_)) => summary.duplicates += 1,
                Ok(IntakeOutcome::Rejected(_)) => summary.rejected += 1,
                Err(e) => {
                    summary.intake_errors += 1;
                    error!(delivery_id = %delivery_id, error = %e, "Delivery not registered, awaiting redelivery");
                }
            }
        }
        info!(?summary, "Delivery source drained");
        summary
    }

    /// Waits for every run task to stop, then stops the health recomputer
    /// after it finishes queued work.
    pub async fn shutdown(&self) {
        let mut in_flight = self.in_flight.subscribe();
        if in_flight.wait_for(|n| *n == 0).await.is_err() {
            warn!("In-flight run counter closed early");
        }
        self.inner.health.shutdown().await;
        info!("Orchestrator stopped");
    }

    /// Runs currently executing in this process.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits until pending health recomputes are written.
    pub async fn flush_health(&self) {
        self.inner.health.flush().await;
    }

    /// Read-side queries sharing this orchestrator's breakers.
    pub fn query_service(&self) -> GraphQueryService {
        GraphQueryService::new(
            Arc::clone(&self.inner.graph),
            CircuitBreakingPublisher::new(
                self.breakers.breaker(&name(dependencies::GRAPH_QUERY)),
                self.retry.clone(),
            ),
        )
    }

    /// Current circuit state of every dependency seen so far.
    pub fn breaker_states(&self) -> Vec<(pipeline::DependencyName, BreakerState)> {
        self.breakers.states()
    }

    /// Counters for this orchestrator.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.inner.metrics
    }

    /// Share of publishes within the freshness target over the SLO window,
    /// `None` before the first publish.
    pub fn slo_compliance(&self) -> Option<f64> {
        self.inner.slo.compliance()
    }
}
