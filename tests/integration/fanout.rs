//! Research fan-out tests: deadlines, partial results and the
//! concurrency bound.

use std::sync::Arc;
use std::time::Duration;

use glossa::aggregate::DefinitionStatus;
use glossa::protocol::TaskStatus;
use glossa::providers::ExtractiveGenerator;
use glossa::workers::{DocumentRequest, RESEARCH_AGENT};
use glossa::WorkflowReport;

use crate::fixtures::{
    entity_names, glossary_doc, research_agent, test_config, Harness, ScriptedResearch,
    ScriptedSearch,
};

fn scripted(config: &glossa::config::Config) -> ScriptedResearch {
    ScriptedResearch::new(research_agent(
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
        config,
    ))
}

fn research_ms(report: &WorkflowReport) -> u64 {
    report.stage_timings_ms["ResearchEntity"]
}

/// Test: Twenty children, two silent
/// Given 20 entities researched concurrently and 2 workers that never answer
/// When the stage deadline elapses
/// Then the workflow completes with errors: 18 verified, 2 unverified
#[tokio::test(start_paused = true)]
async fn test_twenty_children_two_silent() {
    let mut config = test_config();
    config.orchestrator.fanout_concurrency = 20;
    config.orchestrator.stage_deadline_ms = 2_000;
    let research = Arc::new(scripted(&config).silent_on(["Entity3", "Entity17"]));
    let harness = Harness::start(config, research.clone());
    harness.store.insert("twenty.md", glossary_doc(20));

    let result = harness.client().submit(DocumentRequest::stored("twenty.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::CompletedWithErrors);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();

    let summary = report.output.summary;
    assert_eq!(summary.total, 20);
    assert_eq!(summary.verified, 18);
    assert_eq!(summary.unverified, 2);
    assert_eq!(report.affected_entities, vec!["Entity3", "Entity17"]);
    assert_eq!(report.output.affected_entities, report.affected_entities);

    for def in &report.output.definitions {
        if report.affected_entities.contains(&def.entity) {
            assert_eq!(def.status, DefinitionStatus::Unverified);
            assert_eq!(def.confidence, 0.0);
            assert!(def.sources.is_empty());
        } else {
            assert_eq!(def.status, DefinitionStatus::Verified);
            assert!(!def.sources.is_empty());
        }
    }
    assert_eq!(research.calls(), 20);
    let elapsed = research_ms(&report);
    assert!((2_000..2_100).contains(&elapsed), "research took {elapsed}ms");

    // The silent children are cancelled once the deadline passes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.in_flight(RESEARCH_AGENT), 0);
    assert_eq!(harness.orchestrator.pending_results(), 0);
    harness.shutdown().await;
}

/// Test: Fan-out respects the concurrency limit
/// Given 9 entities and a concurrency of 3
/// When every research call takes 100ms
/// Then at most 3 run at once and the stage takes three waves
#[tokio::test(start_paused = true)]
async fn test_fanout_respects_concurrency() {
    let mut config = test_config();
    config.orchestrator.fanout_concurrency = 3;
    let research = Arc::new(scripted(&config).with_delay(Duration::from_millis(100)));
    let harness = Harness::start(config, research.clone());
    harness.store.insert("nine.md", glossary_doc(9));

    let report = harness.client().run(DocumentRequest::stored("nine.md")).await.unwrap();
    assert_eq!(report.output.summary.verified, 9);
    assert_eq!(research.max_active(), 3);
    assert_eq!(research.calls(), 9);
    let elapsed = research_ms(&report);
    assert!((300..400).contains(&elapsed), "research took {elapsed}ms");
    harness.shutdown().await;
}

/// Test: The deadline bounds a stage with a backlog
/// Given 6 slow entities, a concurrency of 2 and a 2s deadline
/// When each call takes 1.5s
/// Then the first wave lands, everything else is unverified at 2s
#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_stage_with_backlog() {
    let mut config = test_config();
    config.orchestrator.fanout_concurrency = 2;
    config.orchestrator.stage_deadline_ms = 2_000;
    let research = Arc::new(scripted(&config).with_delay(Duration::from_millis(1_500)));
    let harness = Harness::start(config, research.clone());
    harness.store.insert("six.md", glossary_doc(6));

    let result = harness.client().submit(DocumentRequest::stored("six.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::CompletedWithErrors);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();

    assert_eq!(report.output.summary.verified, 2);
    assert_eq!(report.output.summary.unverified, 4);
    assert_eq!(report.affected_entities, entity_names(6)[2..].to_vec());
    // Entity4 and Entity5 were never dispatched.
    assert_eq!(research.calls(), 4);
    let elapsed = research_ms(&report);
    assert!((2_000..2_100).contains(&elapsed), "research took {elapsed}ms");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.in_flight(RESEARCH_AGENT), 0);
    harness.shutdown().await;
}
