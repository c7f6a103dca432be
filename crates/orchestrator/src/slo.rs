//! Docs-freshness SLO monitor and alert sinks.
//!
//! Freshness is the time from an event being received to its documentation
//! being published. The monitor keeps a sliding window of recent publishes
//! and raises [`Alert::SloBreach`] when the share within target drops below
//! the objective. Alerts are edge-triggered: one on breach, none again until
//! compliance has recovered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline::{NaturalKey, RunId, RunKey, RunState, Timestamp};
use tracing::{error, info};

use crate::metrics::PipelineMetrics;

/// Freshness objective.
#[derive(Debug, Clone, PartialEq)]
pub struct SloSettings {
    /// A publish within this long after receipt counts as fresh.
    pub freshness_target: Duration,
    /// Required share of fresh publishes, in `(0, 1]`.
    pub objective: f64,
    /// Number of recent publishes considered.
    pub window: usize,
    /// No verdict until this many publishes are in the window.
    pub min_samples: usize,
}

impl Default for SloSettings {
    fn default() -> Self {
        Self {
            freshness_target: Duration::from_secs(180),
            objective: 0.99,
            window: 500,
            min_samples: 20,
        }
    }
}

/// Operator-actionable conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    SloBreach {
        compliance: f64,
        objective: f64,
        samples: usize,
    },
    RunTimedOut {
        run_id: RunId,
        run_key: RunKey,
        state: RunState,
        limit: Duration,
    },
    /// A fail-open policy decision let a change through without the engine.
    PolicyFailOpen {
        run_id: RunId,
        pull_request: NaturalKey,
    },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::SloBreach {
                compliance,
                objective,
                samples,
            } => write!(
                f,
                "docs freshness compliance {:.3} below objective {objective} over {samples} publishes",
                compliance
            ),
            Alert::RunTimedOut {
                run_id,
                run_key,
                state,
                limit,
            } => write!(f, "run {run_id} for {run_key} exceeded {limit:?} at {state}"),
            Alert::PolicyFailOpen {
                run_id,
                pull_request,
            } => write!(
                f,
                "run {run_id} allowed {pull_request} without the policy engine (fail-open)"
            ),
        }
    }
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Writes alerts to the log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        error!(alert = %alert, "ALERT");
    }
}

struct Window {
    samples: VecDeque<bool>,
    fresh: usize,
    breached: bool,
}

pub struct SloMonitor {
    settings: SloSettings,
    window: Mutex<Window>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<PipelineMetrics>,
}

impl SloMonitor {
    pub fn new(
        settings: SloSettings,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(settings.window),
                fresh: 0,
                breached: false,
            }),
            settings,
            alerts,
            metrics,
        }
    }

    /// Records one publish. Returns whether it met the freshness target.
    pub fn record_publish(&self, received_at: Timestamp, published_at: Timestamp) -> bool {
        let freshness = published_at.duration_since(received_at);
        let fresh = freshness <= self.settings.freshness_target;
        self.metrics.record_freshness(freshness);

        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.samples.push_back(fresh);
        if fresh {
            window.fresh += 1;
        }
        while window.samples.len() > self.settings.window.max(1) {
            if window.samples.pop_front() == Some(true) {
                window.fresh -= 1;
            }
        }

        let samples = window.samples.len();
        let compliance = window.fresh as f64 / samples as f64;
        self.metrics.set_slo_compliance(compliance);

        if samples >= self.settings.min_samples {
            let meeting = compliance >= self.settings.objective;
            if !meeting && !window.breached {
                window.breached = true;
                drop(window);
                self.alerts.raise(Alert::SloBreach {
                    compliance,
                    objective: self.settings.objective,
                    samples,
                });
            } else if meeting && window.breached {
                window.breached = false;
                info!(compliance, "Docs freshness SLO recovered");
            }
        }
        fresh
    }

    /// Share of fresh publishes in the window, `None` before the first.
    pub fn compliance(&self) -> Option<f64> {
        let window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (!window.samples.is_empty()).then(|| window.fresh as f64 / window.samples.len() as f64)
    }
}
