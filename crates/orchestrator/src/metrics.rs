//! Pipeline metrics.
//!
//! Every measurement goes to an OpenTelemetry instrument and, for the
//! counters operators ask about most, to an in-process atomic as well so the
//! CLI and the tests can read a [`MetricsSnapshot`] without an exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use pipeline::{Decision, DependencyName, EvaluationResult, FailureKind, RunState};
use resilience::{BreakerState, TransitionObserver};
use serde::Serialize;

/// Intake outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryLabel {
    Accepted,
    Duplicate,
    Rejected,
}

impl DeliveryLabel {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryLabel::Accepted => "accepted",
            DeliveryLabel::Duplicate => "duplicate",
            DeliveryLabel::Rejected => "rejected",
        }
    }
}

/// Point-in-time copy of the in-process counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub breaker_transitions: u64,
    pub breaker_opens: u64,
    pub policy_allowed: u64,
    pub policy_denied: u64,
    pub policy_fallbacks: u64,
    pub slo_compliance: Option<f64>,
}

impl MetricsSnapshot {
    /// Duplicates over all deliveries seen, `0` before the first one.
    pub fn duplicate_rate(&self) -> f64 {
        let total = self.accepted + self.duplicates + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.duplicates as f64 / total as f64
        }
    }
}

pub struct PipelineMetrics {
    deliveries: Counter<u64>,
    step_duration: Histogram<f64>,
    breaker_transitions: Counter<u64>,
    policy_decisions: Counter<u64>,
    docs_freshness: Histogram<f64>,
    runs: Counter<u64>,
    slo_compliance: Gauge<f64>,

    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    transitions: AtomicU64,
    opens: AtomicU64,
    policy_allowed: AtomicU64,
    policy_denied: AtomicU64,
    policy_fallbacks: AtomicU64,
    /// `f64` bits; `u64::MAX` until the first sample.
    compliance_bits: AtomicU64,
}

impl PipelineMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            deliveries: meter
                .u64_counter("codex_deliveries_total")
                .with_description("Deliveries by intake outcome")
                .build(),
            step_duration: meter
                .f64_histogram("codex_step_duration_seconds")
                .with_description("Wall time per pipeline step")
                .with_unit("s")
                .build(),
            breaker_transitions: meter
                .u64_counter("codex_breaker_transitions_total")
                .with_description("Circuit breaker state changes")
                .build(),
            policy_decisions: meter
                .u64_counter("codex_policy_decisions_total")
                .with_description("Policy gate decisions")
                .build(),
            docs_freshness: meter
                .f64_histogram("codex_docs_freshness_seconds")
                .with_description("Event received to documentation published")
                .with_unit("s")
                .build(),
            runs: meter
                .u64_counter("codex_runs_total")
                .with_description("Runs by terminal outcome")
                .build(),
            slo_compliance: meter
                .f64_gauge("codex_slo_compliance_ratio")
                .with_description("Share of recent publishes within the freshness target")
                .build(),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            policy_allowed: AtomicU64::new(0),
            policy_denied: AtomicU64::new(0),
            policy_fallbacks: AtomicU64::new(0),
            compliance_bits: AtomicU64::new(u64::MAX),
        }
    }

    /// Metrics on the global meter provider (a no-op until one is installed).
    pub fn noop() -> Self {
        Self::new(&opentelemetry::global::meter("codex"))
    }

    pub fn record_delivery(&self, label: DeliveryLabel) {
        self.deliveries
            .add(1, &[KeyValue::new("outcome", label.as_str())]);
        let counter = match label {
            DeliveryLabel::Accepted => &self.accepted,
            DeliveryLabel::Duplicate => &self.duplicates,
            DeliveryLabel::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Time spent running the step that leads to `step`.
    pub fn record_step(&self, step: RunState, elapsed: Duration) {
        self.step_duration
            .record(elapsed.as_secs_f64(), &[KeyValue::new("step", step.as_str())]);
    }

    pub fn record_policy_decision(&self, decision: &Decision) {
        self.policy_decisions.add(
            1,
            &[
                KeyValue::new("outcome", decision.outcome.as_str()),
                KeyValue::new("fallback", decision.fallback),
            ],
        );
        match decision.outcome {
            EvaluationResult::Allow => self.policy_allowed.fetch_add(1, Ordering::Relaxed),
            EvaluationResult::Deny => self.policy_denied.fetch_add(1, Ordering::Relaxed),
        };
        if decision.fallback {
            self.policy_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_freshness(&self, freshness: Duration) {
        self.docs_freshness.record(freshness.as_secs_f64(), &[]);
    }

    pub fn set_slo_compliance(&self, ratio: f64) {
        self.slo_compliance.record(ratio, &[]);
        self.compliance_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    /// Counts a run that reached a terminal state.
    pub fn record_run(&self, state: RunState, failure: Option<FailureKind>) {
        let mut labels = vec![KeyValue::new("outcome", state.as_str())];
        if let Some(kind) = failure {
            labels.push(KeyValue::new("failure", kind.as_str()));
        }
        self.runs.add(1, &labels);
        match state {
            RunState::Completed => self.runs_completed.fetch_add(1, Ordering::Relaxed),
            RunState::Failed => self.runs_failed.fetch_add(1, Ordering::Relaxed),
            RunState::Cancelled => self.runs_cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let compliance = self.compliance_bits.load(Ordering::Relaxed);
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            breaker_transitions: self.transitions.load(Ordering::Relaxed),
            breaker_opens: self.opens.load(Ordering::Relaxed),
            policy_allowed: self.policy_allowed.load(Ordering::Relaxed),
            policy_denied: self.policy_denied.load(Ordering::Relaxed),
            policy_fallbacks: self.policy_fallbacks.load(Ordering::Relaxed),
            slo_compliance: (compliance != u64::MAX).then(|| f64::from_bits(compliance)),
        }
    }
}

impl TransitionObserver for PipelineMetrics {
    fn on_transition(&self, dependency: &DependencyName, from: BreakerState, to: BreakerState) {
        self.breaker_transitions.add(
            1,
            &[
                KeyValue::new("dependency", dependency.as_str().to_string()),
                KeyValue::new("to", to.as_str()),
            ],
        );
        self.transitions.fetch_add(1, Ordering::Relaxed);
        if to == BreakerState::Open {
            self.opens.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            dependency = %dependency,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_duplicate_rate_and_compliance() {
        let metrics = PipelineMetrics::noop();
        assert_eq!(metrics.snapshot().duplicate_rate(), 0.0);
        assert_eq!(metrics.snapshot().slo_compliance, None);

        metrics.record_delivery(DeliveryLabel::Accepted);
        for _ in 0..3 {
            metrics.record_delivery(DeliveryLabel::Duplicate);
        }
        metrics.set_slo_compliance(0.5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.duplicates, 3);
        assert!((snapshot.duplicate_rate() - 0.75).abs() < 1e-9);
        assert_eq!(snapshot.slo_compliance, Some(0.5));
    }

    #[test]
    fn breaker_transitions_count_opens() {
        let metrics = PipelineMetrics::noop();
        let dep = DependencyName::new("docs-portal").unwrap();
        metrics.on_transition(&dep, BreakerState::Closed, BreakerState::Open);
        metrics.on_transition(&dep, BreakerState::Open, BreakerState::HalfOpen);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.breaker_transitions, 2);
        assert_eq!(snapshot.breaker_opens, 1);
    }
}
