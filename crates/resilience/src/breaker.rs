//! Circuit breaker state machine and the per-dependency registry.
//!
//! ```text
//! Closed ──(N consecutive failures | failure ratio ≥ R over last W calls)──► Open
//! Open ──(cool-down D elapsed)──► HalfOpen (one probe admitted)
//! HalfOpen ──probe ok──► Closed
//! HalfOpen ──probe failed──► Open
//! ```
//!
//! Only transient failures count. A dependency that answers with a permanent
//! error is up, so that outcome is recorded as a success.
//!
//! Time is read from `tokio::time::Instant` so tests can drive it with
//! `tokio::time::pause` / `advance`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pipeline::DependencyName;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Trip and recovery thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Open after this many consecutive failures (N).
    pub consecutive_failures: u32,
    /// Open when the failure ratio over a full window reaches this value.
    pub failure_ratio: f64,
    /// Sliding window size (W) for the ratio check.
    pub window_size: usize,
    /// How long to stay open before admitting a probe (D).
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            failure_ratio: 0.5,
            window_size: 20,
            cool_down: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// One probe call is in flight or about to be.
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase name, used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Receives every state change of every breaker it is attached to.
pub trait TransitionObserver: Send + Sync {
    /// Called after the breaker for `dependency` moved from `from` to `to`.
    fn on_transition(&self, dependency: &DependencyName, from: BreakerState, to: BreakerState);
}

/// Whether a call may go to the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: go ahead.
    Allowed,
    /// Half-open: this caller is the single probe.
    Probe,
    /// Open, or a probe is already in flight.
    Rejected {
        /// Time until the breaker will admit a probe.
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_started: Instant },
}

impl Phase {
    fn public(self) -> BreakerState {
        match self {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Core {
    phase: Phase,
    consecutive_failures: u32,
    // true = failure
    window: VecDeque<bool>,
}

impl Core {
    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.window.clear();
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Breaker for one downstream dependency, shared by every caller of it.
pub struct CircuitBreaker {
    dependency: DependencyName,
    config: BreakerConfig,
    core: Mutex<Core>,
    observer: Option<Arc<dyn TransitionObserver>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(dependency: DependencyName, config: BreakerConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            dependency,
            config,
            core: Mutex::new(Core {
                phase: Phase::Closed,
                consecutive_failures: 0,
                window,
            }),
            observer: None,
        }
    }

    /// Attaches a transition observer.
    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Dependency this breaker protects.
    pub fn dependency(&self) -> &DependencyName {
        &self.dependency
    }

    /// Thresholds in force.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose cool-down has elapsed still
    /// reports `Open` until the next call is admitted as the probe.
    pub fn state(&self) -> BreakerState {
        self.lock().phase.public()
    }

    /// Decides whether the next call may reach the dependency.
    pub fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut core = self.lock();
        match core.phase {
            Phase::Closed => Admission::Allowed,
            Phase::Open { until } if now >= until => {
                let from = core.phase.public();
                core.phase = Phase::HalfOpen { probe_started: now };
                drop(core);
                self.notify(from, BreakerState::HalfOpen);
                Admission::Probe
            }
            Phase::Open { until } => Admission::Rejected {
                retry_after: until.saturating_duration_since(now),
            },
            Phase::HalfOpen { probe_started } => {
                // A probe that never reported back (caller dropped) is
                // replaced once a full cool-down has passed.
                if now.saturating_duration_since(probe_started) >= self.config.cool_down {
                    core.phase = Phase::HalfOpen { probe_started: now };
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }

    /// Records a call that reached the dependency and got an answer.
    pub fn record_success(&self) {
        let mut core = self.lock();
        match core.phase {
            Phase::Closed => {
                core.consecutive_failures = 0;
                self.push_outcome(&mut core, false);
            }
            Phase::HalfOpen { .. } => {
                core.phase = Phase::Closed;
                core.reset_counters();
                drop(core);
                tracing::info!(dependency = %self.dependency, "Circuit closed after successful probe");
                self.notify(BreakerState::HalfOpen, BreakerState::Closed);
            }
            // Late answer from a call admitted before the breaker opened.
            Phase::Open { .. } => {}
        }
    }

    /// Records a transient failure.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut core = self.lock();
        match core.phase {
            Phase::Closed => {
                core.consecutive_failures += 1;
                self.push_outcome(&mut core, true);
                if self.should_trip(&core) {
                    let consecutive = core.consecutive_failures;
                    core.phase = Phase::Open {
                        until: now + self.config.cool_down,
                    };
                    core.reset_counters();
                    drop(core);
                    tracing::warn!(
                        dependency = %self.dependency,
                        consecutive_failures = consecutive,
                        cool_down_ms = self.config.cool_down.as_millis() as u64,
                        "Circuit opened"
                    );
                    self.notify(BreakerState::Closed, BreakerState::Open);
                }
            }
            Phase::HalfOpen { .. } => {
                core.phase = Phase::Open {
                    until: now + self.config.cool_down,
                };
                drop(core);
                tracing::warn!(dependency = %self.dependency, "Probe failed; circuit re-opened");
                self.notify(BreakerState::HalfOpen, BreakerState::Open);
            }
            Phase::Open { .. } => {}
        }
    }

    fn should_trip(&self, core: &Core) -> bool {
        if core.consecutive_failures >= self.config.consecutive_failures {
            return true;
        }
        if self.config.window_size == 0 || core.window.len() < self.config.window_size {
            return false;
        }
        let failures = core.window.iter().filter(|f| **f).count();
        failures as f64 / core.window.len() as f64 >= self.config.failure_ratio
    }

    fn push_outcome(&self, core: &mut Core, failed: bool) {
        if self.config.window_size == 0 {
            return;
        }
        if core.window.len() == self.config.window_size {
            core.window.pop_front();
        }
        core.window.push_back(failed);
    }

    fn notify(&self, from: BreakerState, to: BreakerState) {
        if let Some(observer) = &self.observer {
            observer.on_transition(&self.dependency, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        // The core holds plain counters; a panic elsewhere cannot leave them
        // in a state that is unsafe to keep using.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Hands out one shared breaker per dependency name.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<DependencyName, BreakerConfig>,
    observer: Option<Arc<dyn TransitionObserver>>,
    breakers: Mutex<HashMap<DependencyName, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers use `default_config`.
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            observer: None,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `config` for `dependency` instead of the default.
    pub fn with_override(mut self, dependency: DependencyName, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency, config);
        self
    }

    /// Attaches `observer` to every breaker created from now on.
    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &DependencyName) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(dependency.clone())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(dependency)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                let breaker = CircuitBreaker::new(dependency.clone(), config);
                Arc::new(match &self.observer {
                    Some(observer) => breaker.with_observer(Arc::clone(observer)),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Current state of every breaker created so far.
    pub fn states(&self) -> Vec<(DependencyName, BreakerState)> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn dep() -> DependencyName {
        DependencyName::new("graph-query").unwrap()
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            consecutive_failures: 5,
            failure_ratio: 0.5,
            window_size: 20,
            cool_down: Duration::from_secs(10),
        }
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<(BreakerState, BreakerState)>>);

    impl TransitionObserver for Recorder {
        fn on_transition(&self, _: &DependencyName, from: BreakerState, to: BreakerState) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures_and_probes_after_cool_down() {
        let recorder = Arc::new(Recorder::default());
        let breaker = CircuitBreaker::new(dep(), config()).with_observer(recorder.clone());

        for _ in 0..4 {
            assert_eq!(breaker.admit(), Admission::Allowed);
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        match breaker.admit() {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(10)),
            other => panic!("expected rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(), Admission::Probe);
        // Only one probe at a time.
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
                (BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_for_another_cool_down() {
        let breaker = CircuitBreaker::new(dep(), config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn ratio_over_full_window_trips_without_a_consecutive_run() {
        let breaker = CircuitBreaker::new(
            dep(),
            BreakerConfig {
                consecutive_failures: 100,
                failure_ratio: 0.5,
                window_size: 4,
                cool_down: Duration::from_secs(1),
            },
        );
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_success();
        // Window is now full at 2/4 failures.
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_consecutive_count() {
        let breaker = CircuitBreaker::new(
            dep(),
            BreakerConfig {
                window_size: 0,
                ..config()
            },
        );
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_shares_one_breaker_per_dependency() {
        let registry = BreakerRegistry::new(config()).with_override(
            DependencyName::new("policy-engine").unwrap(),
            BreakerConfig {
                consecutive_failures: 1,
                ..config()
            },
        );
        let a = registry.breaker(&dep());
        let b = registry.breaker(&dep());
        assert!(Arc::ptr_eq(&a, &b));

        let policy = registry.breaker(&DependencyName::new("policy-engine").unwrap());
        assert_eq!(policy.config().consecutive_failures, 1);
        assert_eq!(registry.states().len(), 2);
    }
}
