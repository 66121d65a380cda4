//! Recovery tests: retries, redelivery, transport outages and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use glossa::aggregate::DefinitionStatus;
use glossa::error::ErrorKind;
use glossa::protocol::TaskStatus;
use glossa::providers::ExtractiveGenerator;
use glossa::workers::{DocumentRequest, ORCHESTRATOR_AGENT, RESEARCH_AGENT};
use glossa::WorkflowReport;

use crate::fixtures::{
    glossary_doc, research_agent, test_config, FlakySearch, Harness, ScriptedResearch,
    ScriptedSearch,
};

/// Test: Transient failures are retried
/// Given a search provider that is rate limited twice
/// When an entity is researched with max_retries = 3
/// Then the third call succeeds and the workflow completes
#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let search = Arc::new(FlakySearch::new(2));
    let harness = Harness::with_providers(test_config(), search.clone(), Arc::new(ExtractiveGenerator));
    harness.store.insert("one.md", glossary_doc(1));

    let result = harness.client().submit(DocumentRequest::stored("one.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();
    assert_eq!(report.output.definitions[0].status, DefinitionStatus::Verified);
    assert_eq!(search.calls(), 3);
    harness.shutdown().await;
}

/// Test: Exhausted retries leave the entity unverified
/// Given a search provider that never recovers
/// When retries run out
/// Then the child fails, the entity is unverified and the root completes with errors
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_mark_entity_unverified() {
    let search = Arc::new(FlakySearch::new(usize::MAX));
    let harness = Harness::with_providers(test_config(), search.clone(), Arc::new(ExtractiveGenerator));
    harness.store.insert("one.md", glossary_doc(1));

    let result = harness.client().submit(DocumentRequest::stored("one.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::CompletedWithErrors);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();
    assert_eq!(report.output.definitions[0].status, DefinitionStatus::Unverified);
    assert_eq!(report.affected_entities, vec!["Entity0"]);
    // One attempt plus three retries.
    assert_eq!(search.calls(), 4);
    harness.shutdown().await;
}

/// Test: Redelivered envelopes run once
/// Given a broker that delivers every envelope twice
/// When a workflow runs
/// Then each child is handled exactly once and duplicates are suppressed
#[tokio::test]
async fn test_redelivery_runs_each_task_once() {
    let config = test_config();
    let search = Arc::new(ScriptedSearch::default());
    let research = Arc::new(ScriptedResearch::new(research_agent(
        search.clone(),
        Arc::new(ExtractiveGenerator),
        &config,
    )));
    let harness = Harness::start(config, research.clone());
    harness.store.insert("five.md", glossary_doc(5));
    harness.broker.duplicate_next(10_000);

    let result = harness.client().submit(DocumentRequest::stored("five.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(research.calls(), 5);
    assert_eq!(search.calls(), 5);
    assert!(harness.broker.stats().duplicates_suppressed > 0);
    harness.shutdown().await;
}

/// Test: Transport outage fails fast and recovers
#[tokio::test]
async fn test_broker_outage_is_transient() {
    let harness = Harness::with_providers(
        test_config(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
    );
    harness.store.insert("two.md", glossary_doc(2));
    let client = harness.client();

    harness.broker.set_available(false);
    let err = client.submit(DocumentRequest::stored("two.md")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    harness.broker.set_available(true);
    let result = client.submit(DocumentRequest::stored("two.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    harness.shutdown().await;
}

/// Test: Client timeout cancels the whole tree
/// Given research workers that never answer and a long stage deadline
/// When the client gives up after 1s
/// Then the root is cancelled and every child with it
#[tokio::test(start_paused = true)]
async fn test_client_timeout_cancels_workflow() {
    let mut config = test_config();
    config.orchestrator.stage_deadline_ms = 60_000;
    let research = Arc::new(
        ScriptedResearch::new(research_agent(
            Arc::new(ScriptedSearch::default()),
            Arc::new(ExtractiveGenerator),
            &config,
        ))
        .silent_on(["Entity0", "Entity1", "Entity2"]),
    );
    let harness = Harness::start(config, research.clone());
    harness.store.insert("three.md", glossary_doc(3));

    let client = harness.client().with_timeout(Duration::from_secs(1));
    let result = client.submit(DocumentRequest::stored("three.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::TimedOut);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(research.calls(), 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.in_flight(ORCHESTRATOR_AGENT), 0);
    assert_eq!(harness.in_flight(RESEARCH_AGENT), 0);
    assert_eq!(harness.orchestrator.pending_results(), 0);
    assert_eq!(harness.orchestrator.tracked_tasks(), 0);
    harness.shutdown().await;
}
