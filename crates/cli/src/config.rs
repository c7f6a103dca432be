//! `codex.toml` loading and validation.
//!
//! Every section is optional. Values are validated once at load time; a
//! process never starts with an inconsistent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator::{AnalyzerSettings, GateSettings, OrchestratorSettings, SloSettings};
use pipeline::{PipelineError, PolicyFailureMode, PolicyId, RiskScore};
use resilience::{BreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "codex.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodexConfig {
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
    pub orchestrator: OrchestratorConfig,
    pub breaker: BreakerSection,
    pub retry: RetrySection,
    pub policy: PolicyConfig,
    pub portal: PortalConfig,
    pub coverage: ServiceConfig,
    pub risk: ServiceConfig,
    pub analysis: AnalysisConfig,
    pub slo: SloSection,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codex-data/codex.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// How long delivery records are kept.
    pub retention_hours: u64,
    /// How long upstream may redeliver an event.
    pub replay_window_hours: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            replay_window_hours: 72,
        }
    }
}

/// Upper bound on `ledger.retention_hours` (ten years).
pub const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

impl LedgerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub step_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
    pub max_step_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 60,
            run_timeout_secs: 900,
            analysis_timeout_secs: 30,
            max_step_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub consecutive_failures: u32,
    pub failure_ratio: f64,
    pub window_size: usize,
    pub cool_down_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            failure_ratio: 0.5,
            window_size: 20,
            cool_down_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub engine_url: String,
    pub decision_path: String,
    pub timeout_secs: u64,
    /// Decision when the engine is unreachable.
    pub failure_mode: PolicyFailureMode,
    /// Policy evaluated for pull requests that name none.
    pub default_policy: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine_url: "http://127.0.0.1:8181".to_string(),
            decision_path: "/v1/data/codex/gate".to_string(),
            timeout_secs: 5,
            failure_mode: PolicyFailureMode::FailClosed,
            default_policy: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8090".to_string(),
            timeout_secs: 10,
        }
    }
}

/// An optional downstream service; absent `url` disables it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Checkouts live under `<workspace_root>/<owner>/<repo>`.
    pub workspace_root: PathBuf,
    /// Risk floor for runs whose analysis was incomplete.
    pub default_risk_score: f64,
    /// Read CODEOWNERS and record file ownership in the graph.
    pub owners_enabled: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            default_risk_score: 50.0,
            owners_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SloSection {
    pub freshness_target_secs: u64,
    pub objective: f64,
    pub window: usize,
    pub min_samples: usize,
}

impl Default for SloSection {
    fn default() -> Self {
        Self {
            freshness_target_secs: 180,
            objective: 0.99,
            window: 500,
            min_samples: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// OTLP gRPC endpoint for spans and metrics; export is off when unset.
    pub otlp_endpoint: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Configuration {
        message: message.into(),
    }
}

impl CodexConfig {
    /// Reads `path`. A missing file yields the defaults unless `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("invalid configuration in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let ledger = &self.ledger;
        if ledger.retention_hours > MAX_RETENTION_HOURS {
            return Err(invalid(format!(
                "ledger.retention_hours ({}) exceeds the maximum of {MAX_RETENTION_HOURS}",
                ledger.retention_hours
            )));
        }
        if ledger.retention_hours < ledger.replay_window_hours {
            return Err(invalid(format!(
                "ledger.retention_hours ({}) is shorter than ledger.replay_window_hours ({}); \
                 records would expire while redeliveries are still possible",
                ledger.retention_hours, ledger.replay_window_hours
            )));
        }

        let o = &self.orchestrator;
        for (name, value) in [
            ("orchestrator.step_timeout_secs", o.step_timeout_secs),
            ("orchestrator.run_timeout_secs", o.run_timeout_secs),
            ("orchestrator.analysis_timeout_secs", o.analysis_timeout_secs),
            ("breaker.cool_down_secs", self.breaker.cool_down_secs),
            ("slo.freshness_target_secs", self.slo.freshness_target_secs),
            ("policy.timeout_secs", self.policy.timeout_secs),
            ("portal.timeout_secs", self.portal.timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }
        if o.run_timeout_secs < o.step_timeout_secs {
            return Err(invalid(
                "orchestrator.run_timeout_secs must be at least orchestrator.step_timeout_secs",
            ));
        }
        if o.step_timeout_secs < o.analysis_timeout_secs {
            return Err(invalid(
                "orchestrator.step_timeout_secs must be at least orchestrator.analysis_timeout_secs",
            ));
        }
        if o.max_step_attempts == 0 {
            return Err(invalid("orchestrator.max_step_attempts must be at least 1"));
        }

        let b = &self.breaker;
        if b.consecutive_failures == 0 {
            return Err(invalid("breaker.consecutive_failures must be at least 1"));
        }
        if !(b.failure_ratio > 0.0 && b.failure_ratio <= 1.0) {
            return Err(invalid("breaker.failure_ratio must be in (0, 1]"));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if r.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(invalid("retry.jitter must be in [0, 1]"));
        }
        if r.initial_backoff_ms > r.max_backoff_ms {
            return Err(invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms"));
        }

        if PolicyId::new(self.policy.default_policy.as_str()).is_none() {
            return Err(invalid("policy.default_policy must not be blank"));
        }
        if RiskScore::new(self.analysis.default_risk_score).is_none() {
            return Err(invalid("analysis.default_risk_score must be in [0, 100]"));
        }

        let s = &self.slo;
        if !(s.objective > 0.0 && s.objective <= 1.0) {
            return Err(invalid("slo.objective must be in (0, 1]"));
        }
        if s.window == 0 || s.min_samples > s.window {
            return Err(invalid("slo.window must be non-zero and at least slo.min_samples"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            consecutive_failures: self.breaker.consecutive_failures,
            failure_ratio: self.breaker.failure_ratio,
            window_size: self.breaker.window_size,
            cool_down: Duration::from_secs(self.breaker.cool_down_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            step_timeout: Duration::from_secs(self.orchestrator.step_timeout_secs),
            run_timeout: Duration::from_secs(self.orchestrator.run_timeout_secs),
            max_step_attempts: self.orchestrator.max_step_attempts,
            step_retry: self.retry_config(),
        }
    }

    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            timeout: Duration::from_secs(self.orchestrator.analysis_timeout_secs),
            default_risk_score: RiskScore::clamped(self.analysis.default_risk_score),
            resolve_owners: self.analysis.owners_enabled,
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        let default_policy = PolicyId::new(self.policy.default_policy.as_str())
            .unwrap_or_else(|| PolicyId::from_static("default"));
        GateSettings {
            failure_mode: self.policy.failure_mode,
            default_policy,
        }
    }

    pub fn slo_settings(&self) -> SloSettings {
        SloSettings {
            freshness_target: Duration::from_secs(self.slo.freshness_target_secs),
            objective: self.slo.objective,
            window: self.slo.window,
            min_samples: self.slo.min_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = CodexConfig::parse("").unwrap();
        assert_eq!(config, CodexConfig::default());
        assert_eq!(config.policy.failure_mode, PolicyFailureMode::FailClosed);
        assert_eq!(config.ledger.retention(), Duration::from_secs(72 * 3600));
        assert_eq!(config.breaker_config(), BreakerConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = CodexConfig::parse(
            r#"
            [policy]
            failure_mode = "fail_open"
            default_policy = "baseline"

            [orchestrator]
            step_timeout_secs = 20
            run_timeout_secs = 120
            analysis_timeout_secs = 10

            [analysis]
            owners_enabled = false

            [telemetry]
            format = "pretty"
            otlp_endpoint = "http://collector:4317"
            "#,
        )
        .unwrap();
        let gate = config.gate_settings();
        assert_eq!(gate.failure_mode, PolicyFailureMode::FailOpen);
        assert_eq!(gate.default_policy.as_str(), "baseline");
        assert_eq!(
            config.orchestrator_settings().run_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(config.telemetry.format, LogFormat::Pretty);
        assert!(!config.analyzer_settings().resolve_owners);
    }

    #[test]
    fn retention_shorter_than_replay_window_is_rejected() {
        let err = CodexConfig::parse(
            r#"
            [ledger]
            retention_hours = 24
            replay_window_hours = 72
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("retention_hours"));
    }

    #[test]
    fn retention_beyond_the_maximum_is_rejected() {
        let err = CodexConfig::parse(&format!(
            "[ledger]\nretention_hours = {}\nreplay_window_hours = 72",
            u64::MAX / 1000
        ))
        .unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));

        let config = CodexConfig::parse(&format!(
            "[ledger]\nretention_hours = {MAX_RETENTION_HOURS}"
        ))
        .unwrap();
        assert_eq!(
            config.ledger.retention(),
            Duration::from_secs(MAX_RETENTION_HOURS * 3600)
        );
    }

    #[test]
    fn retention_conversion_saturates() {
        let ledger = LedgerConfig {
            retention_hours: u64::MAX,
            replay_window_hours: 72,
        };
        assert_eq!(ledger.retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        for text in [
            "[orchestrator]\nrun_timeout_secs = 10\nstep_timeout_secs = 60",
            "[orchestrator]\nstep_timeout_secs = 0",
            "[breaker]\nfailure_ratio = 1.5",
            "[retry]\njitter = 2.0",
            "[slo]\nobjective = 0.0",
            "[analysis]\ndefault_risk_score = 150.0",
        ] {
            assert!(CodexConfig::parse(text).is_err(), "accepted: {text}");
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(CodexConfig::parse("[store]\npth = \"x.db\"").is_err());
    }

    #[test]
    fn missing_optional_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(
            CodexConfig::load(&path, false).unwrap(),
            CodexConfig::default()
        );
        assert!(CodexConfig::load(&path, true).is_err());
    }
}
