//! Asynchronous repository health recomputation.
//!
//! Graph writes only schedule a recompute; a background task drains the
//! queue, coalescing bursts so a repository is recomputed once per burst no
//! matter how many runs touched it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use pipeline::{
    EntityKind, EntityUpsert, GraphWriteBatch, HealthScore, KnowledgeGraph, NaturalKey,
    PullRequestState, RepositoryName, StorageError, Timestamp,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Recompute(RepositoryName),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// `100 - mean(risk)` over open pull requests; `100` when there are none.
pub fn health_score(open_pull_request_risks: &[f64]) -> HealthScore {
    if open_pull_request_risks.is_empty() {
        return HealthScore::MAX;
    }
    let mean = open_pull_request_risks.iter().sum::<f64>() / open_pull_request_risks.len() as f64;
    HealthScore::clamped(100.0 - mean)
}

/// Handle to the background recompute task.
pub struct HealthRecomputer {
    tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthRecomputer {
    /// Starts the background task on the current runtime.
    pub fn spawn(graph: Arc<dyn KnowledgeGraph>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(graph, rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues a recompute for `repository`.
    pub fn schedule(&self, repository: &RepositoryName) {
        if self.tx.send(Command::Recompute(repository.clone())).is_err() {
            debug!(repository = %repository, "Health recomputer stopped, recompute dropped");
        }
    }

    /// Waits until every recompute queued before this call has finished.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Finishes queued work and stops the task.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health recomputer task ended abnormally");
            }
        }
    }
}

async fn run(graph: Arc<dyn KnowledgeGraph>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(first) = rx.recv().await {
        let mut pending = BTreeSet::new();
        let mut waiters = Vec::new();
        let mut stop = false;

        let mut absorb = |command: Command| match command {
            Command::Recompute(repository) => {
                pending.insert(repository);
            }
            Command::Flush(done) => waiters.push(done),
            Command::Shutdown => stop = true,
        };
        absorb(first);
        while let Ok(next) = rx.try_recv() {
            absorb(next);
        }

        for repository in &pending {
            if let Err(e) = recompute(graph.as_ref(), repository).await {
                warn!(repository = %repository, error = %e, "Health recompute failed");
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
        if stop {
            break;
        }
    }
    debug!("Health recomputer stopped");
}

async fn recompute(
    graph: &dyn KnowledgeGraph,
    repository: &RepositoryName,
) -> Result<HealthScore, StorageError> {
    let pull_requests = graph.entities_in(EntityKind::PullRequest, repository).await?;
    let open_risks: Vec<f64> = pull_requests
        .iter()
        .filter(|pr| pr.attr_str("state") == Some(PullRequestState::Open.as_str()))
        .filter_map(|pr| pr.attr_f64("risk_score"))
        .collect();
    let score = health_score(&open_risks);

    let mut batch = GraphWriteBatch::new();
    batch.upsert_entity(
        EntityUpsert::new(EntityKind::Repository, NaturalKey::repository(repository))
            .in_repository(repository)
            .attr("health_score", score.as_f64())
            .attr("open_pull_requests", open_risks.len())
            .attr("last_analyzed", Timestamp::now().to_string()),
    );
    graph.apply(&batch).await?;

    info!(repository = %repository, health_score = %score, open = open_risks.len(), "Repository health recomputed");
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_is_inverse_mean_risk_of_open_pull_requests() {
        assert_eq!(health_score(&[]), HealthScore::MAX);
        assert_eq!(health_score(&[20.0, 40.0]), HealthScore::clamped(70.0));
        assert_eq!(health_score(&[100.0]), HealthScore::MIN);
    }
}
