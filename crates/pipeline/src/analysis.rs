//! Impact-analysis value types and the collaborator ports the analyzer uses.
//!
//! The analyzer itself (with its timeout and degradation rules) lives in the
//! `orchestrator` crate; this module defines *what* it produces and *which*
//! external collaborators it needs:
//!
//! | Port | Supplies |
//! |------|----------|
//! | [`SourceSnapshot`] | symbols (with complexity, calls, embeddings) of a file at a commit, and the CODEOWNERS file |
//! | [`CoverageReporter`] | coverage delta from CI |
//! | [`RiskScorer`] | initial risk score |
//!
//! [`HeuristicRiskScorer`] is the built-in scorer and also the degraded
//! default when an external scorer is unavailable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    CommitSha, ComplexityScore, DependencyError, Embedding, FactBundle, FileOwnership, FilePath,
    RepositoryName, RiskScore, Subject, SymbolName,
};

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// Kind of a source symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolType {
    /// Free function.
    Function,
    /// Method on a type.
    Method,
    /// Struct, class, enum, trait, interface.
    Type,
    /// Module or namespace.
    Module,
    /// Anything else the snapshot reports.
    Other,
}

impl SymbolType {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolType::Function => "function",
            SymbolType::Method => "method",
            SymbolType::Type => "type",
            SymbolType::Module => "module",
            SymbolType::Other => "other",
        }
    }
}

/// Reference to a symbol by its natural identity within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRef {
    /// Symbol name.
    pub name: SymbolName,
    /// File that defines it.
    pub file_path: FilePath,
}

/// One symbol found in a changed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFacts {
    /// Symbol name.
    pub name: SymbolName,
    /// Defining file.
    pub file_path: FilePath,
    /// Symbol kind.
    pub symbol_type: SymbolType,
    /// Complexity estimate.
    pub complexity: ComplexityScore,
    /// Symbols this one calls.
    #[serde(default)]
    pub calls: Vec<SymbolRef>,
    /// Semantic embedding, when the snapshot provides one.
    #[serde(default)]
    pub embedding: Option<Embedding>,
}

// ---------------------------------------------------------------------------
// Analysis result
// ---------------------------------------------------------------------------

/// Size bucket for a change, by lines changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeCategory {
    /// ≤ 20 lines.
    XS,
    /// ≤ 80 lines.
    S,
    /// ≤ 200 lines.
    M,
    /// ≤ 500 lines.
    L,
    /// More than 500 lines.
    XL,
}

impl SizeCategory {
    /// Buckets a line count.
    pub fn from_lines(lines_changed: u64) -> Self {
        match lines_changed {
            0..=20 => SizeCategory::XS,
            21..=80 => SizeCategory::S,
            81..=200 => SizeCategory::M,
            201..=500 => SizeCategory::L,
            _ => SizeCategory::XL,
        }
    }
}

/// Derived facts about a change.
///
/// `analysis_incomplete` is set when the analysis was cut short by its time
/// bound or a collaborator was unavailable; downstream steps treat the
/// symbol list and coverage as best-effort in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    /// Symbols in the changed files (possibly partial).
    pub symbols: Vec<SymbolFacts>,
    /// Coverage delta in percentage points, if known.
    pub coverage_delta: Option<f64>,
    /// Initial risk score.
    pub risk_score: RiskScore,
    /// Size bucket.
    pub size_category: SizeCategory,
    /// True when any part of the analysis was skipped or degraded.
    pub analysis_incomplete: bool,
    /// Human-readable notes on what was degraded and why.
    #[serde(default)]
    pub degradations: Vec<String>,
    /// CODEOWNERS assignments for the changed files that have owners.
    #[serde(default)]
    pub owners: Vec<FileOwnership>,
}

impl ImpactAnalysis {
    /// An empty, complete analysis (used for events with nothing to analyse).
    pub fn empty(risk_score: RiskScore) -> Self {
        Self {
            symbols: Vec::new(),
            coverage_delta: None,
            risk_score,
            size_category: SizeCategory::XS,
            analysis_incomplete: false,
            degradations: Vec::new(),
            owners: Vec::new(),
        }
    }

    /// Records a degradation and flags the analysis as incomplete.
    pub fn degrade(&mut self, note: impl Into<String>) {
        self.analysis_incomplete = true;
        self.degradations.push(note.into());
    }
}

// ---------------------------------------------------------------------------
// Collaborator ports
// ---------------------------------------------------------------------------

/// Addressable source snapshot of a repository at a commit.
#[async_trait]
pub trait SourceSnapshot: Send + Sync {
    /// Lists the symbols defined in `path` at `sha` (or the default branch
    /// head when `sha` is `None`). A file that no longer exists yields an
    /// empty list.
    async fn symbols(
        &self,
        repository: &RepositoryName,
        sha: Option<&CommitSha>,
        path: &FilePath,
    ) -> Result<Vec<SymbolFacts>, DependencyError>;

    /// Raw text of the repository's CODEOWNERS file at `sha`, or `None` when
    /// the repository has none. Snapshots that cannot see repository
    /// metadata keep the default.
    async fn code_owners(
        &self,
        _repository: &RepositoryName,
        _sha: Option<&CommitSha>,
    ) -> Result<Option<String>, DependencyError> {
        Ok(None)
    }
}

/// CI coverage collaborator.
#[async_trait]
pub trait CoverageReporter: Send + Sync {
    /// Coverage delta in percentage points for `sha` against its base, or
    /// `None` when CI has not reported yet.
    async fn coverage_delta(
        &self,
        repository: &RepositoryName,
        sha: &CommitSha,
    ) -> Result<Option<f64>, DependencyError>;
}

/// Inputs to risk scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskInput {
    /// Conventional-commit type inferred from the title (`"feat"`, `"fix"`, ...).
    pub change_type: String,
    /// Additions plus deletions.
    pub lines_changed: u64,
    /// Files touched.
    pub files_touched: u32,
    /// Coverage delta in percentage points, if known.
    pub coverage_delta: Option<f64>,
    /// A label flags the change as security-relevant.
    pub security_flag: bool,
    /// The change adds or touches tests.
    pub touches_tests: bool,
}

impl RiskInput {
    /// Builds scorer input from a fact bundle and a known coverage delta.
    pub fn from_facts(facts: &FactBundle, coverage_delta: Option<f64>) -> Self {
        let files = facts.changed_files();
        let touches_tests = files.iter().any(|f| {
            let p = f.path.as_str();
            p.contains("test") || p.contains("spec")
        });
        match &facts.subject {
            Subject::PullRequest(pr) => Self {
                change_type: change_type_of(&pr.title),
                lines_changed: pr.additions + pr.deletions,
                files_touched: pr.changed_file_count.max(files.len() as u32),
                coverage_delta,
                security_flag: pr.labels.iter().any(|l| l.to_ascii_lowercase().contains("security")),
                touches_tests,
            },
            _ => Self {
                change_type: "chore".to_string(),
                lines_changed: 0,
                files_touched: files.len() as u32,
                coverage_delta,
                security_flag: false,
                touches_tests,
            },
        }
    }
}

/// Extracts the conventional-commit type from a title (`"fix(api): ..."` →
/// `"fix"`). Titles without a recognised prefix count as `"feat"`.
fn change_type_of(title: &str) -> String {
    let head = title
        .split(|c: char| c == ':' || c == '(' || c == '!')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match head.as_str() {
        "docs" | "chore" | "fix" | "feat" | "refactor" | "test" | "perf" | "ci" | "build" => head,
        _ => "feat".to_string(),
    }
}

/// External or built-in risk scoring collaborator.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    /// Scores a change.
    async fn score(&self, input: &RiskInput) -> Result<RiskScore, DependencyError>;
}

// ---------------------------------------------------------------------------
// Heuristic scorer
// ---------------------------------------------------------------------------

/// Weighted heuristic risk model.
///
/// Each factor contributes a capped fraction; the sum is clamped to `[0, 1]`
/// and scaled to `[0, 100]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicRiskScorer {
    /// Lines changed that saturate the size factor.
    pub size_threshold: f64,
    /// Files touched that saturate the churn factor.
    pub max_files: f64,
    /// Added when the change is security-flagged.
    pub security_penalty: f64,
    /// Added (negative) when the change touches tests.
    pub test_bonus: f64,
}

impl Default for HeuristicRiskScorer {
    fn default() -> Self {
        Self {
            size_threshold: 800.0,
            max_files: 50.0,
            security_penalty: 0.30,
            test_bonus: -0.15,
        }
    }
}

impl HeuristicRiskScorer {
    /// Synchronous scoring, shared by the trait impl and degraded paths.
    pub fn score_now(&self, input: &RiskInput) -> RiskScore {
        let type_risk = match input.change_type.as_str() {
            "docs" => 0.05,
            "chore" | "test" | "ci" | "build" => 0.10,
            "fix" | "refactor" | "perf" => 0.20,
            "feat" => 0.25,
            _ => 0.20,
        };
        let size_risk = (input.lines_changed as f64 / self.size_threshold).min(0.25);
        let churn_risk = (f64::from(input.files_touched) / self.max_files).min(0.10);
        let coverage_risk = match input.coverage_delta {
            Some(delta) if delta < 0.0 => (-delta).min(0.20),
            _ => 0.0,
        };
        let security_risk = if input.security_flag {
            self.security_penalty
        } else {
            0.0
        };
        let test_bonus = if input.touches_tests { self.test_bonus } else { 0.0 };

        let total = type_risk + size_risk + churn_risk + coverage_risk + security_risk + test_bonus;
        let rounded = (total.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
        RiskScore::clamped(rounded * 100.0)
    }
}

#[async_trait]
impl RiskScorer for HeuristicRiskScorer {
    async fn score(&self, input: &RiskInput) -> Result<RiskScore, DependencyError> {
        Ok(self.score_now(input))
    }
}
