//! Documentation page rendering for the `Published` step.

use std::fmt::Write as _;

use pipeline::{
    redact_secrets, FactBundle, ImpactAnalysis, PipelineError, PublishRequest, RunCheckpoint,
    StorageError, Subject,
};

/// Symbols listed on a page before the rest are summarised as a count.
const MAX_LISTED_SYMBOLS: usize = 20;

/// Builds the portal request for a run that has facts and analysis.
///
/// # Errors
///
/// [`PipelineError::Storage`] when the checkpoint lacks the facts or the
/// analysis its state implies.
pub fn publish_request(checkpoint: &RunCheckpoint) -> Result<PublishRequest, PipelineError> {
    let facts = checkpoint
        .facts
        .as_ref()
        .ok_or_else(|| StorageError::corruption("run checkpoint without facts"))?;
    let analysis = checkpoint
        .analysis
        .as_ref()
        .ok_or_else(|| StorageError::corruption("run checkpoint without analysis"))?;

    Ok(PublishRequest {
        idempotency_key: checkpoint.run_id,
        delivery_id: checkpoint.delivery_id().clone(),
        repository: facts.repository.name.clone(),
        run_key: checkpoint.run_key.clone(),
        title: title(facts),
        body: body(checkpoint, facts, analysis),
        risk_score: Some(analysis.risk_score),
        policy_outcome: checkpoint.decision.as_ref().map(|d| d.outcome),
        event_received_at: facts.received_at,
    })
}

fn title(facts: &FactBundle) -> String {
    match &facts.subject {
        Subject::PullRequest(pr) => format!("{} #{}: {}", facts.repository.name, pr.number, pr.title),
        Subject::Push(push) => {
            let short = push.head_sha.as_str().get(..7).unwrap_or(push.head_sha.as_str());
            format!("{} push to {} ({short})", facts.repository.name, push.git_ref)
        }
        Subject::Release(release) => format!("{} release {}", facts.repository.name, release.name),
    }
}

fn body(checkpoint: &RunCheckpoint, facts: &FactBundle, analysis: &ImpactAnalysis) -> String {
    // Writing to a String cannot fail.
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", title(facts));

    match &facts.subject {
        Subject::PullRequest(pr) => {
            let _ = writeln!(out, "- Author: @{}", pr.author);
            let _ = writeln!(out, "- State: {}", pr.state.as_str());
            let _ = writeln!(
                out,
                "- Size: {:?} (+{} / -{}, {} files)",
                analysis.size_category, pr.additions, pr.deletions, pr.changed_file_count
            );
            if !pr.labels.is_empty() {
                let _ = writeln!(out, "- Labels: {}", pr.labels.join(", "));
            }
        }
        Subject::Push(push) => {
            let _ = writeln!(out, "- Pusher: @{}", push.pusher);
            let _ = writeln!(out, "- Commit: {}", push.head_sha);
        }
        Subject::Release(release) => {
            let _ = writeln!(out, "- Tag: {}", release.tag);
            let _ = writeln!(out, "- Author: @{}", release.author);
            let _ = writeln!(out, "- Published: {}", release.published_at);
        }
    }
    let _ = writeln!(out, "- Risk score: {}", analysis.risk_score);
    if let Some(delta) = analysis.coverage_delta {
        let _ = writeln!(out, "- Coverage delta: {delta:+.2} pp");
    }

    if let Subject::PullRequest(pr) = &facts.subject {
        if !pr.summary.is_empty() {
            let _ = writeln!(out, "\n{}", redact_secrets(&pr.summary));
        }
    }
    if let Subject::Release(release) = &facts.subject {
        if !release.body.trim().is_empty() {
            let _ = writeln!(out, "\n{}", redact_secrets(release.body.trim()));
        }
    }

    let files = facts.changed_files();
    if !files.is_empty() {
        let _ = writeln!(out, "\n## Files\n");
        for file in files {
            let _ = writeln!(out, "- `{}` ({:?})", file.path, file.status);
        }
    }

    if !analysis.symbols.is_empty() {
        let _ = writeln!(out, "\n## Symbols\n");
        for symbol in analysis.symbols.iter().take(MAX_LISTED_SYMBOLS) {
            let _ = writeln!(
                out,
                "- `{}` in `{}` ({}, complexity {})",
                symbol.name,
                symbol.file_path,
                symbol.symbol_type.as_str(),
                symbol.complexity
            );
        }
        if analysis.symbols.len() > MAX_LISTED_SYMBOLS {
            let _ = writeln!(out, "- and {} more", analysis.symbols.len() - MAX_LISTED_SYMBOLS);
        }
    }

    if let Some(decision) = &checkpoint.decision {
        let _ = writeln!(out, "\n## Policy\n");
        let _ = writeln!(out, "Outcome: **{}**", decision.outcome.as_str());
        for reason in &decision.reasons {
            let _ = writeln!(out, "- {reason}");
        }
        if decision.audit_fail_open {
            let _ = writeln!(out, "\n> Allowed without the policy engine; flagged for audit.");
        }
    }

    if analysis.analysis_incomplete {
        let _ = writeln!(out, "\n## Analysis incomplete\n");
        for note in &analysis.degradations {
            let _ = writeln!(out, "- {note}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{
        extract_facts, Decision, Delivery, DeliveryId, PolicyFailureMode, PolicyId, RiskScore,
        RunId, RunState,
    };
    use serde_json::json;

    fn checkpoint() -> RunCheckpoint {
        let delivery = Delivery::new(
            DeliveryId::new("abc-1").unwrap(),
            "pull_request",
            json!({
                "action": "opened",
                "repository": { "full_name": "acme/widgets" },
                "pull_request": {
                    "number": 42,
                    "title": "feat: add sprockets",
                    "user": { "login": "octocat" },
                    "state": "open",
                    "changed_files": 1,
                    "additions": 10,
                    "deletions": 0,
                    "created_at": "2024-05-01T10:00:00Z",
                    "updated_at": "2024-05-01T10:05:00Z"
                },
                "files": [{ "path": "src/sprocket.rs", "status": "added" }]
            }),
        );
        let facts = extract_facts(&delivery).unwrap();
        let mut cp = RunCheckpoint::registered(RunId::new_random(), facts.run_key(), delivery);
        cp.facts = Some(facts);
        let mut analysis = ImpactAnalysis::empty(RiskScore::clamped(35.0));
        analysis.degrade("coverage unavailable");
        cp.analysis = Some(analysis);
        cp.decision = Some(Decision::unavailable(
            PolicyFailureMode::FailClosed,
            &[PolicyId::new("p1").unwrap()],
        ));
        cp.advance(RunState::PolicyEvaluated);
        cp
    }

    #[test]
    fn request_carries_run_id_as_idempotency_key() {
        let cp = checkpoint();
        let request = publish_request(&cp).unwrap();
        assert_eq!(request.idempotency_key, cp.run_id);
        assert_eq!(request.title, "acme/widgets #42: feat: add sprockets");
        assert!(request.body.contains("Outcome: **deny**"));
        assert!(request.body.contains("## Analysis incomplete"));
        assert!(request.body.contains("`src/sprocket.rs`"));
    }

    #[test]
    fn missing_analysis_is_reported() {
        let mut cp = checkpoint();
        cp.analysis = None;
        assert!(matches!(
            publish_request(&cp),
            Err(PipelineError::Storage(StorageError::Corruption { .. }))
        ));
    }

    #[test]
    fn page_body_masks_credentials_from_the_description() {
        let mut cp = checkpoint();
        let token = format!("ghp_{}", "Z9y8".repeat(10));
        if let Some(Subject::PullRequest(pr)) = cp.facts.as_mut().map(|f| &mut f.subject) {
            pr.summary = format!("Use {token} and ssh-rsa AAAAB3NzaC1yc2EAAA== to deploy.");
        }
        let body = publish_request(&cp).unwrap().body;
        assert!(!body.contains(&token));
        assert!(body.contains("Use ‹GH_TOKEN_REDACTED› and ‹SSH_KEY_REDACTED› to deploy."));
    }
}
