//! Intake deduplication against a real SQLite ledger.

mod support;

use std::sync::Arc;

use orchestrator::IntakeOutcome;
use pipeline::{
    Delivery, DeliveryId, DeliveryOutcome, EntityKind, KnowledgeGraph, RepositoryName, RunState,
    RunStore,
};
use serde_json::json;
use support::{AllowAllEngine, RecordingPortal};
use tokio::task::JoinSet;

fn repo() -> RepositoryName {
    RepositoryName::new("acme/widgets").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_identical_deliveries_produce_one_run() {
    let store = support::store();
    let portal = Arc::new(RecordingPortal::default());
    let orchestrator = Arc::new(
        support::builder(
            &store,
            support::collaborators(Arc::new(AllowAllEngine), portal.clone()),
        )
        .build(),
    );

    let mut submissions = JoinSet::new();
    for _ in 0..50 {
        let orchestrator = Arc::clone(&orchestrator);
        submissions.spawn(async move {
            orchestrator
                .submit(support::pr_delivery("abc-1", 42))
                .await
                .unwrap()
        });
    }

    let mut accepted = Vec::new();
    let mut duplicates = 0;
    while let Some(outcome) = submissions.join_next().await {
        match outcome.unwrap() {
            IntakeOutcome::Accepted(handle) => accepted.push(handle),
            IntakeOutcome::Duplicate(_) => duplicates += 1,
            IntakeOutcome::Rejected(e) => panic!("unexpected rejection: {e}"),
        }
    }
    assert_eq!(accepted.len(), 1);
    assert_eq!(duplicates, 49);

    let state = accepted.pop().unwrap().wait().await.unwrap();
    assert_eq!(state, RunState::Completed);
    orchestrator.shutdown().await;

    let pull_requests = store
        .entities_in(EntityKind::PullRequest, &repo())
        .await
        .unwrap();
    assert_eq!(pull_requests.len(), 1);
    assert_eq!(pull_requests[0].attr_str("title"), Some("feat: add sprockets"));

    let mut symbols: Vec<String> = store
        .entities_in(EntityKind::Symbol, &repo())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|s| s.attr_str("name").map(str::to_string))
        .collect();
    symbols.sort();
    assert_eq!(symbols, vec!["lib_entry", "sprocket_entry"]);

    assert_eq!(portal.published().len(), 1);
    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.accepted, 1);
    assert_eq!(snapshot.duplicates, 49);
    assert_eq!(snapshot.runs_completed, 1);
}

#[tokio::test]
async fn redelivery_after_restart_is_acknowledged_without_a_run() {
    let store = support::store();
    let portal = Arc::new(RecordingPortal::default());

    let first = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), portal.clone()),
    )
    .build();
    let IntakeOutcome::Accepted(handle) = first.submit(support::pr_delivery("abc-2", 7)).await.unwrap()
    else {
        panic!("first sighting must be accepted");
    };
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunState::Completed);
    first.shutdown().await;

    let second = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), portal.clone()),
    )
    .build();
    match second.submit(support::pr_delivery("abc-2", 7)).await.unwrap() {
        IntakeOutcome::Duplicate(record) => {
            assert_eq!(record.outcome, DeliveryOutcome::Accepted { run_id });
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert!(second.resume_pending().await.unwrap().is_empty());
    second.shutdown().await;
    assert_eq!(portal.published().len(), 1);
}

#[tokio::test]
async fn malformed_delivery_is_rejected_once_then_acknowledged() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();

    let malformed = || {
        Delivery::new(
            DeliveryId::new("bad-1").unwrap(),
            "pull_request",
            json!({ "action": "opened", "pull_request": { "number": 3 } }),
        )
    };

    match orchestrator.submit(malformed()).await.unwrap() {
        IntakeOutcome::Rejected(e) => assert_eq!(e.field, "repository"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(matches!(
        orchestrator.submit(malformed()).await.unwrap(),
        IntakeOutcome::Duplicate(_)
    ));
    assert!(store
        .by_delivery(&DeliveryId::new("bad-1").unwrap())
        .await
        .unwrap()
        .is_none());

    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.rejected, 1);
    assert_eq!(snapshot.duplicates, 1);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unparseable_facts_fail_the_run_as_malformed() {
    let store = support::store();
    let orchestrator = support::builder(
        &store,
        support::collaborators(Arc::new(AllowAllEngine), Arc::new(RecordingPortal::default())),
    )
    .build();

    // The run key is derivable, but the pull request lacks its title.
    let mut payload = support::pr_payload(9, "x");
    payload["pull_request"]
        .as_object_mut()
        .unwrap()
        .remove("title");
    let delivery = Delivery::new(DeliveryId::new("half-1").unwrap(), "pull_request", payload);

    let IntakeOutcome::Accepted(handle) = orchestrator.submit(delivery).await.unwrap() else {
        panic!("run key is derivable, so the delivery is accepted");
    };
    assert_eq!(handle.wait().await.unwrap(), RunState::Failed);

    let checkpoint = store
        .by_delivery(&DeliveryId::new("half-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    let failure = checkpoint.failure.unwrap();
    assert_eq!(failure.kind, pipeline::FailureKind::Malformed);
    assert_eq!(failure.at, RunState::Registered);
    orchestrator.shutdown().await;
}
