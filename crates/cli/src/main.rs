//! Codex CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load `codex.toml` and validate it.
//! 2. **Wire observability**: install `tracing-subscriber` with an `EnvFilter`
//!    and a JSON or pretty layer, plus OTLP span and metric export when an
//!    endpoint is configured.
//! 3. **Construct infrastructure**: open the SQLite store, build the HTTP
//!    adapters and the workspace snapshot, and inject them into the
//!    [`Orchestrator`].
//! 4. **Dispatch a subcommand**:
//!    - `run`: resume unfinished runs, then process deliveries from an NDJSON
//!      file or stdin until it ends.
//!    - `prune`: delete ledger records past the retention window.
//!    - `runs`: list unfinished runs.
//!    - `graph`: read-side queries against the knowledge graph.
//!
//! Storage initialisation and configuration failures abort the process;
//! everything after that is isolated to the run it affects.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clients::{
    HttpClientConfig, HttpCoverageReporter, HttpDocumentationPortal, HttpPolicyEngine,
    HttpRiskScorer, WorkspaceSnapshot,
};
use listener::NdjsonEventSource;
use orchestrator::dependencies::{self, name};
use orchestrator::{Collaborators, GraphQueryService, Orchestrator, PipelineMetrics, Stores};
use pipeline::{
    CoverageReporter, DeliveryLedger, HeuristicRiskScorer, KnowledgeGraph, PullRequestNumber,
    RepositoryName, RiskScorer, RunStore, Timestamp,
};
use resilience::{BreakerRegistry, CircuitBreakingPublisher};
use serde::Serialize;
use store::SqliteStore;
use tracing::{error, info};

use crate::config::{CodexConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "codex", version)]
#[command(about = "Durable, idempotent repository event pipeline", long_about = None)]
struct Cli {
    /// Configuration file [default: ./codex.toml, optional]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume unfinished runs, then process deliveries until the input ends
    Run {
        /// NDJSON delivery file; reads stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Delete delivery records older than the retention window
    Prune,

    /// List runs that have not reached a terminal state
    Runs,

    /// Query the knowledge graph
    Graph {
        #[command(subcommand)]
        query: GraphQuery,
    },
}

#[derive(Subcommand)]
enum GraphQuery {
    /// A pull request with its relationships and policy evaluations
    Pr {
        /// Repository full name, e.g. `acme/widgets`
        repository: String,
        /// Pull request number
        number: u64,
    },

    /// Entity, edge, and evaluation counts
    Stats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("codex: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("codex: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (path, required) = match cli.config {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let config = CodexConfig::load(&path, required)?;
    let telemetry = telemetry::init(&config.telemetry)?;

    let result = dispatch(cli.command, &config).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Command failed");
    }
    telemetry.shutdown();
    result
}

async fn dispatch(command: Command, config: &CodexConfig) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(&config.store.path)
            .with_context(|| format!("opening store at {}", config.store.path.display()))?,
    );

    let result = match command {
        Command::Run { input } => run_pipeline(config, &store, input).await,
        Command::Prune => prune(config, &store).await,
        Command::Runs => list_runs(&store).await,
        Command::Graph { query } => graph(config, &store, query).await,
    };

    SqliteStore::close(store.as_ref().clone())
        .await
        .context("closing store")?;
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn http(url: &str, timeout_secs: u64) -> HttpClientConfig {
    HttpClientConfig::new(url).with_timeout(Duration::from_secs(timeout_secs))
}

fn collaborators(config: &CodexConfig) -> Result<Collaborators> {
    let policy_engine = HttpPolicyEngine::new(
        name(dependencies::POLICY_ENGINE),
        &http(&config.policy.engine_url, config.policy.timeout_secs),
        config.policy.decision_path.clone(),
    )?;
    let portal = HttpDocumentationPortal::new(
        name(dependencies::DOCS_PORTAL),
        &http(&config.portal.url, config.portal.timeout_secs),
    )?;

    let coverage: Option<Arc<dyn CoverageReporter>> = match &config.coverage.url {
        Some(url) => Some(Arc::new(HttpCoverageReporter::new(
            name(dependencies::COVERAGE),
            &http(url, config.coverage.timeout_secs),
        )?)),
        None => None,
    };
    let risk_scorer: Arc<dyn RiskScorer> = match &config.risk.url {
        Some(url) => Arc::new(HttpRiskScorer::new(
            name(dependencies::RISK_SCORER),
            &http(url, config.risk.timeout_secs),
        )?),
        None => Arc::new(HeuristicRiskScorer::default()),
    };

    Ok(Collaborators {
        snapshot: Arc::new(WorkspaceSnapshot::new(
            name(dependencies::SOURCE_SNAPSHOT),
            config.analysis.workspace_root.clone(),
        )),
        coverage,
        risk_scorer,
        policy_engine: Arc::new(policy_engine),
        portal: Arc::new(portal),
    })
}

#[derive(Serialize)]
struct RunReport {
    resumed: usize,
    intake: orchestrator::IntakeSummary,
    metrics: orchestrator::MetricsSnapshot,
    breakers: Vec<(String, &'static str)>,
}

async fn run_pipeline(
    config: &CodexConfig,
    store: &Arc<SqliteStore>,
    input: Option<PathBuf>,
) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new(&opentelemetry::global::meter("codex")));
    let orchestrator = Orchestrator::builder(
        Stores::from_shared(Arc::clone(store)),
        collaborators(config)?,
    )
    .settings(config.orchestrator_settings())
    .analyzer(config.analyzer_settings())
    .gate(config.gate_settings())
    .breaker(config.breaker_config())
    .retry(config.retry_config())
    .slo(config.slo_settings())
    .metrics(Arc::clone(&metrics))
    .build();

    info!(
        failure_mode = ?config.policy.failure_mode,
        store = %config.store.path.display(),
        "Pipeline starting"
    );
    let resumed = orchestrator.resume_pending().await?.len();

    let intake = match input {
        Some(path) => {
            let mut source = NdjsonEventSource::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            orchestrator.consume(&mut source).await
        }
        None => orchestrator.consume(&mut NdjsonEventSource::stdin()).await,
    };
    orchestrator.shutdown().await;

    print_json(&RunReport {
        resumed,
        intake,
        metrics: metrics.snapshot(),
        breakers: orchestrator
            .breaker_states()
            .into_iter()
            .map(|(dependency, state)| (dependency.to_string(), state.as_str()))
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// prune / runs
// ---------------------------------------------------------------------------

async fn prune(config: &CodexConfig, store: &Arc<SqliteStore>) -> Result<()> {
    let cutoff = Timestamp::now().saturating_sub(config.ledger.retention());
    let removed = store.prune_expired(cutoff).await?;
    info!(removed, cutoff = %cutoff, "Ledger pruned");
    print_json(&serde_json::json!({ "removed": removed, "cutoff": cutoff }))
}

#[derive(Serialize)]
struct RunRow {
    run_id: String,
    state: &'static str,
    run_key: String,
    delivery_id: String,
    created_at: Timestamp,
    updated_at: Timestamp,
}

async fn list_runs(store: &Arc<SqliteStore>) -> Result<()> {
    let rows: Vec<RunRow> = store
        .unfinished()
        .await?
        .into_iter()
        .map(|cp| RunRow {
            run_id: cp.run_id.to_string(),
            state: cp.state.as_str(),
            run_key: cp.run_key.to_string(),
            delivery_id: cp.delivery_id().to_string(),
            created_at: cp.created_at,
            updated_at: cp.updated_at,
        })
        .collect();
    print_json(&rows)
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

async fn graph(config: &CodexConfig, store: &Arc<SqliteStore>, query: GraphQuery) -> Result<()> {
    match query {
        GraphQuery::Pr { repository, number } => {
            let repository = RepositoryName::new(repository)
                .context("repository must not be empty")?;
            let breakers = BreakerRegistry::new(config.breaker_config());
            let queries = GraphQueryService::new(
                Arc::clone(store) as Arc<dyn KnowledgeGraph>,
                CircuitBreakingPublisher::new(
                    breakers.breaker(&name(dependencies::GRAPH_QUERY)),
                    config.retry_config(),
                ),
            );
            let view = queries
                .pull_request(&repository, PullRequestNumber::new(number))
                .await?
                .into_inner()
                .with_context(|| format!("{repository} #{number} is not in the graph"))?;
            print_json(&view)
        }
        GraphQuery::Stats => print_json(&store.stats().await?),
    }
}
