//! Impact Analyzer.
//!
//! Collects symbols and CODEOWNERS ownership for the changed files, the CI
//! coverage delta, and an initial risk score. The whole analysis shares one deadline. When it runs
//! out, or a collaborator is unavailable, the analyzer keeps what it has,
//! flags the result `analysis_incomplete`, and lets the run continue.

use std::sync::Arc;

use pipeline::{
    CodeOwners, CoverageReporter, DependencyError, FactBundle, FileStatus, HeuristicRiskScorer,
    ImpactAnalysis, RiskInput, RiskScore, RiskScorer, SizeCategory, SourceSnapshot,
};
use resilience::CircuitBreakingPublisher;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::settings::AnalyzerSettings;

/// A collaborator paired with the publisher that guards calls to it.
pub struct Guard<T: ?Sized> {
    target: Arc<T>,
    calls: CircuitBreakingPublisher,
}

impl<T: ?Sized> Guard<T> {
    pub fn new(target: Arc<T>, calls: CircuitBreakingPublisher) -> Self {
        Self { target, calls }
    }
}

/// Bounded, degrading impact analysis.
pub struct ImpactAnalyzer {
    snapshot: Guard<dyn SourceSnapshot>,
    coverage: Option<Guard<dyn CoverageReporter>>,
    scorer: Guard<dyn RiskScorer>,
    heuristic: HeuristicRiskScorer,
    settings: AnalyzerSettings,
}

impl ImpactAnalyzer {
    pub fn new(
        snapshot: Guard<dyn SourceSnapshot>,
        coverage: Option<Guard<dyn CoverageReporter>>,
        scorer: Guard<dyn RiskScorer>,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            snapshot,
            coverage,
            scorer,
            heuristic: HeuristicRiskScorer::default(),
            settings,
        }
    }

    /// Replaces the scorer used when the configured one is unavailable.
    pub fn with_heuristic(mut self, heuristic: HeuristicRiskScorer) -> Self {
        self.heuristic = heuristic;
        self
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Analyses a fact bundle. Never fails; problems become degradations.
    pub async fn analyze(&self, facts: &FactBundle) -> ImpactAnalysis {
        let deadline = Instant::now() + self.settings.timeout;
        let mut analysis = ImpactAnalysis::empty(RiskScore::MIN);

        self.collect_symbols(facts, deadline, &mut analysis).await;
        if self.settings.resolve_owners {
            self.collect_owners(facts, deadline, &mut analysis).await;
        }
        self.collect_coverage(facts, deadline, &mut analysis).await;

        let input = RiskInput::from_facts(facts, analysis.coverage_delta);
        analysis.size_category = SizeCategory::from_lines(input.lines_changed);
        analysis.risk_score = self.score(&input, deadline, &mut analysis).await;

        if analysis.analysis_incomplete {
            let floor = self.settings.default_risk_score;
            if analysis.risk_score.as_f64() < floor.as_f64() {
                analysis.risk_score = floor;
            }
            warn!(
                delivery_id = %facts.delivery_id,
                degradations = ?analysis.degradations,
                risk_score = %analysis.risk_score,
                "Impact analysis incomplete"
            );
        } else {
            debug!(
                delivery_id = %facts.delivery_id,
                symbols = analysis.symbols.len(),
                risk_score = %analysis.risk_score,
                "Impact analysis complete"
            );
        }
        analysis
    }

    async fn collect_symbols(
        &self,
        facts: &FactBundle,
        deadline: Instant,
        analysis: &mut ImpactAnalysis,
    ) {
        let repository = &facts.repository.name;
        let sha = facts.head_sha();
        let snapshot: &dyn SourceSnapshot = self.snapshot.target.as_ref();

        for file in facts.changed_files() {
            if file.status == FileStatus::Removed {
                continue;
            }
            let path = &file.path;
            let call = self
                .snapshot
                .calls
                .call(move |_| snapshot.symbols(repository, sha, path));
            match timeout_at(deadline, call).await {
                Ok(Ok(symbols)) => analysis.symbols.extend(symbols),
                Ok(Err(err @ DependencyError::CircuitOpen { .. })) => {
                    analysis.degrade(format!("symbol collection skipped: {err}"));
                    return;
                }
                Ok(Err(err)) => {
                    analysis.degrade(format!("symbols for {path} unavailable: {err}"));
                }
                Err(_) => {
                    analysis.degrade(format!(
                        "time bound of {:?} reached during symbol collection",
                        self.settings.timeout
                    ));
                    return;
                }
            }
        }
    }

    async fn collect_owners(
        &self,
        facts: &FactBundle,
        deadline: Instant,
        analysis: &mut ImpactAnalysis,
    ) {
        let files = facts.changed_files();
        if files.is_empty() {
            return;
        }
        let repository = &facts.repository.name;
        let sha = facts.head_sha();
        let snapshot: &dyn SourceSnapshot = self.snapshot.target.as_ref();

        let call = self
            .snapshot
            .calls
            .call(move |_| snapshot.code_owners(repository, sha));
        let text = match timeout_at(deadline, call).await {
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                analysis.degrade(format!("code owners unavailable: {err}"));
                return;
            }
            Err(_) => {
                analysis.degrade("time bound reached before code owners were read");
                return;
            }
        };

        let code_owners = CodeOwners::parse(&text);
        if !code_owners.rejected().is_empty() {
            warn!(
                repository = %repository,
                patterns = ?code_owners.rejected(),
                "Ignoring CODEOWNERS patterns that do not compile"
            );
        }
        analysis.owners = code_owners.resolve(
            files
                .iter()
                .filter(|f| f.status != FileStatus::Removed)
                .map(|f| &f.path),
        );
    }

    async fn collect_coverage(
        &self,
        facts: &FactBundle,
        deadline: Instant,
        analysis: &mut ImpactAnalysis,
    ) {
        let (Some(coverage), Some(sha)) = (&self.coverage, facts.head_sha()) else {
            return;
        };
        let repository = &facts.repository.name;
        let reporter: &dyn CoverageReporter = coverage.target.as_ref();

        let call = coverage
            .calls
            .call(move |_| reporter.coverage_delta(repository, sha));
        match timeout_at(deadline, call).await {
            Ok(Ok(delta)) => analysis.coverage_delta = delta,
            Ok(Err(err)) => analysis.degrade(format!("coverage unavailable: {err}")),
            Err(_) => analysis.degrade("time bound reached before coverage was reported"),
        }
    }

    async fn score(
        &self,
        input: &RiskInput,
        deadline: Instant,
        analysis: &mut ImpactAnalysis,
    ) -> RiskScore {
        let scorer: &dyn RiskScorer = self.scorer.target.as_ref();
        let call = self.scorer.calls.call(move |_| scorer.score(input));
        match timeout_at(deadline, call).await {
            Ok(Ok(score)) => score,
            Ok(Err(err)) => {
                analysis.degrade(format!("risk scorer unavailable, heuristic used: {err}"));
                self.heuristic.score_now(input)
            }
            Err(_) => {
                analysis.degrade("time bound reached before scoring, heuristic used");
                self.heuristic.score_now(input)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use pipeline::{
        extract_facts, CommitSha, ComplexityScore, Delivery, DeliveryId, DependencyName,
        FilePath, RepositoryName, SymbolFacts, SymbolName, SymbolType,
    };
    use resilience::{BreakerConfig, CircuitBreaker, RetryConfig};
    use serde_json::json;

    struct Snapshot {
        delay: Duration,
        code_owners: Option<&'static str>,
    }

    #[async_trait]
    impl SourceSnapshot for Snapshot {
        async fn symbols(
            &self,
            _repository: &RepositoryName,
            _sha: Option<&CommitSha>,
            path: &FilePath,
        ) -> Result<Vec<SymbolFacts>, DependencyError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![SymbolFacts {
                name: SymbolName::new(format!("sym_{}", path.as_str().len())).unwrap(),
                file_path: path.clone(),
                symbol_type: SymbolType::Function,
                complexity: ComplexityScore::new(2.0).unwrap(),
                calls: Vec::new(),
                embedding: None,
            }])
        }

        async fn code_owners(
            &self,
            _repository: &RepositoryName,
            _sha: Option<&CommitSha>,
        ) -> Result<Option<String>, DependencyError> {
            Ok(self.code_owners.map(str::to_string))
        }
    }

    struct Coverage(Option<f64>);

    #[async_trait]
    impl CoverageReporter for Coverage {
        async fn coverage_delta(
            &self,
            _repository: &RepositoryName,
            _sha: &CommitSha,
        ) -> Result<Option<f64>, DependencyError> {
            Ok(self.0)
        }
    }

    struct DownScorer;

    #[async_trait]
    impl RiskScorer for DownScorer {
        async fn score(&self, _input: &RiskInput) -> Result<RiskScore, DependencyError> {
            Err(DependencyError::transient(
                &DependencyName::new("risk-scorer").unwrap(),
                "503",
            ))
        }
    }

    fn calls(name: &str) -> CircuitBreakingPublisher {
        CircuitBreakingPublisher::new(
            Arc::new(CircuitBreaker::new(
                DependencyName::new(name).unwrap(),
                BreakerConfig::default(),
            )),
            RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: 0.0,
            },
        )
    }

    fn analyzer(
        delay: Duration,
        coverage: Option<f64>,
        scorer: Arc<dyn RiskScorer>,
    ) -> ImpactAnalyzer {
        ImpactAnalyzer::new(
            Guard::new(
                Arc::new(Snapshot {
                    delay,
                    code_owners: Some("* @acme/core\n/src/a.rs @alice\n"),
                }),
                calls("source-snapshot"),
            ),
            Some(Guard::new(Arc::new(Coverage(coverage)), calls("coverage"))),
            Guard::new(scorer, calls("risk-scorer")),
            AnalyzerSettings {
                timeout: Duration::from_secs(5),
                default_risk_score: RiskScore::clamped(60.0),
                resolve_owners: true,
            },
        )
    }

    fn facts() -> FactBundle {
        let payload = json!({
            "action": "opened",
            "repository": { "full_name": "acme/widgets" },
            "pull_request": {
                "number": 7,
                "title": "fix: tighten parser",
                "user": { "login": "octocat" },
                "state": "open",
                "head": { "sha": "abc123" },
                "changed_files": 3,
                "additions": 30,
                "deletions": 10,
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:05:00Z"
            },
            "files": [
                { "path": "src/a.rs", "status": "modified" },
                { "path": "src/bb.rs", "status": "added" },
                { "path": "src/gone.rs", "status": "removed" }
            ]
        });
        let delivery = Delivery::new(DeliveryId::new("d-1").unwrap(), "pull_request", payload);
        extract_facts(&delivery).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn complete_analysis_skips_removed_files() {
        let analyzer = analyzer(
            Duration::from_millis(10),
            Some(-1.5),
            Arc::new(HeuristicRiskScorer::default()),
        );
        let analysis = analyzer.analyze(&facts()).await;

        assert!(!analysis.analysis_incomplete);
        assert_eq!(analysis.symbols.len(), 2);
        assert_eq!(analysis.coverage_delta, Some(-1.5));
        assert_eq!(analysis.size_category, SizeCategory::S);
        // 0.20 fix + 0.05 size + 0.06 churn + 0.20 coverage drop
        assert!((analysis.risk_score.as_f64() - 51.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn owners_are_resolved_for_surviving_files() {
        let analyzer = analyzer(
            Duration::ZERO,
            None,
            Arc::new(HeuristicRiskScorer::default()),
        );
        let analysis = analyzer.analyze(&facts()).await;

        assert!(!analysis.analysis_incomplete);
        let owners: Vec<(&str, &str, &str)> = analysis
            .owners
            .iter()
            .map(|o| (o.path.as_str(), o.pattern.as_str(), o.owners[0].handle.as_str()))
            .collect();
        assert_eq!(
            owners,
            [
                ("src/a.rs", "/src/a.rs", "alice"),
                ("src/bb.rs", "*", "acme/core"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn owner_resolution_can_be_switched_off() {
        let mut analyzer = analyzer(
            Duration::ZERO,
            None,
            Arc::new(HeuristicRiskScorer::default()),
        );
        analyzer.settings.resolve_owners = false;
        let analysis = analyzer.analyze(&facts()).await;
        assert!(analysis.owners.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn time_bound_keeps_partial_symbols() {
        let analyzer = analyzer(
            Duration::from_secs(3),
            None,
            Arc::new(HeuristicRiskScorer::default()),
        );
        let analysis = analyzer.analyze(&facts()).await;

        assert!(analysis.analysis_incomplete);
        assert_eq!(analysis.symbols.len(), 1);
        assert!(analysis.degradations[0].contains("symbol collection"));
        assert!(analysis.risk_score.as_f64() >= 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_scorer_degrades_to_heuristic_with_floor() {
        let analyzer = analyzer(Duration::ZERO, Some(0.0), Arc::new(DownScorer));
        let analysis = analyzer.analyze(&facts()).await;

        assert!(analysis.analysis_incomplete);
        assert_eq!(analysis.symbols.len(), 2);
        assert!(analysis.degradations.iter().any(|d| d.contains("heuristic")));
        assert_eq!(analysis.risk_score, RiskScore::clamped(60.0));
    }
}
