//! Full workflow execution tests.

use std::sync::Arc;

use glossa::aggregate::DefinitionStatus;
use glossa::error::ErrorKind;
use glossa::protocol::{Intent, TaskStatus};
use glossa::providers::{CorpusSearch, ExtractiveGenerator};
use glossa::workers::DocumentRequest;
use glossa::{Error, WorkflowReport};

use crate::fixtures::{glossary_doc, test_config, FilteredGenerator, Harness, ScriptedSearch};

const NOTES: &str = "\
# Runtime Notes

[term] Tokio: Tokio is an asynchronous runtime.

We build on **Serde** for wire formats.

[term] Tokio: Tokio schedules tasks cooperatively.
";

/// Test: Pipeline end to end
/// Given a document with two entities, one mentioned twice
/// When the workflow runs
/// Then both entities are verified, once each, and nothing stays tracked
#[tokio::test]
async fn test_pipeline_end_to_end() {
    let search = Arc::new(ScriptedSearch::default());
    let harness = Harness::with_providers(test_config(), search.clone(), Arc::new(ExtractiveGenerator));
    harness.store.insert("notes.md", NOTES);

    let result = harness.client().submit(DocumentRequest::stored("notes.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();

    let output = &report.output;
    assert_eq!(output.doc_id, "notes.md");
    assert_eq!(output.title.as_deref(), Some("Runtime Notes"));
    let entities: Vec<_> = output.definitions.iter().map(|d| d.entity.as_str()).collect();
    assert_eq!(entities, vec!["Tokio", "Serde"]);
    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.verified, 2);
    assert!(report.affected_entities.is_empty());

    for def in &output.definitions {
        assert_eq!(def.status, DefinitionStatus::Verified);
        assert!(!def.definition_text.is_empty());
        // Both Tokio children cite the same url: merged into one source.
        assert_eq!(def.sources.len(), 1);
        assert!((def.confidence - 0.9).abs() < 1e-9);
    }
    assert_eq!(search.calls(), 3, "one search per distinct (entity, context)");

    let stages: Vec<_> = report.stage_timings_ms.keys().map(String::as_str).collect();
    assert_eq!(
        stages,
        vec!["AssembleOutput", "ExtractEntities", "ParseDocument", "ResearchEntity"]
    );
    assert_eq!(harness.orchestrator.pending_results(), 0);
    assert_eq!(harness.orchestrator.tracked_tasks(), 0);
    harness.shutdown().await;
}

/// Test: Inline content and Markdown rendering
#[tokio::test]
async fn test_inline_document_renders_markdown() {
    let harness = Harness::with_providers(
        test_config(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
    );

    let report = harness
        .client()
        .run(DocumentRequest::inline("inline.md", glossary_doc(2)))
        .await
        .unwrap();
    let markdown = report.output.render_markdown();
    assert!(markdown.starts_with("# Glossary: Test Glossary"));
    assert!(markdown.contains("2 entities: 2 verified, 0 degraded, 0 unverified."));
    assert!(markdown.contains("## Entity0"));
    assert!(markdown.contains("## Entity1"));
    harness.shutdown().await;
}

/// Test: Empty generation degrades instead of failing
/// Given a generator that only returns filtered, empty text
/// When the workflow runs
/// Then every entity is still present, degraded at the confidence floor
/// and citing the snippet it fell back to
#[tokio::test]
async fn test_filtered_generation_degrades_to_floor() {
    let config = test_config();
    let floor = config.aggregation.degraded_confidence_floor;
    let harness = Harness::with_providers(
        config,
        Arc::new(ScriptedSearch::default()),
        Arc::new(FilteredGenerator),
    );
    harness.store.insert("g.md", glossary_doc(3));

    let result = harness.client().submit(DocumentRequest::stored("g.md")).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    let report: WorkflowReport = serde_json::from_value(result.result.unwrap()).unwrap();

    assert_eq!(report.output.summary.total, 3);
    assert_eq!(report.output.summary.degraded, 3);
    for def in &report.output.definitions {
        assert_eq!(def.status, DefinitionStatus::Degraded);
        assert_eq!(def.confidence, floor);
        assert_eq!(def.definition_text, format!("{} is a documented concept.", def.entity));
        assert_eq!(def.sources.len(), 1);
        assert_eq!(def.sources[0].confidence, floor);
        assert_eq!(
            def.sources[0].url.as_deref(),
            Some(format!("https://ref.example/{}", def.entity.to_lowercase()).as_str())
        );
    }
    harness.shutdown().await;
}

/// Test: Nothing found and nothing generated
/// Given an empty corpus and a generator that only returns filtered text
/// When the workflow runs
/// Then every entity is kept but marked unverified with no definition
#[tokio::test]
async fn test_empty_research_is_unverified() {
    let harness = Harness::with_providers(
        test_config(),
        Arc::new(CorpusSearch::new()),
        Arc::new(FilteredGenerator),
    );
    harness.store.insert("g.md", glossary_doc(2));

    let report = harness.client().run(DocumentRequest::stored("g.md")).await.unwrap();
    assert_eq!(report.output.summary.total, 2);
    assert_eq!(report.output.summary.unverified, 2);
    assert_eq!(report.output.summary.degraded, 0);
    for def in &report.output.definitions {
        assert_eq!(def.status, DefinitionStatus::Unverified);
        assert_eq!(def.confidence, 0.0);
        assert!(def.definition_text.is_empty());
    }
    assert!(report.affected_entities.is_empty());
    harness.shutdown().await;
}

/// Test: A document without candidates still produces an output
#[tokio::test]
async fn test_document_without_entities() {
    let harness = Harness::with_providers(
        test_config(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
    );

    let report = harness
        .client()
        .run(DocumentRequest::inline("prose.md", "Just prose here.\n\nMore prose."))
        .await
        .unwrap();
    assert!(report.output.definitions.is_empty());
    assert_eq!(report.output.summary.total, 0);
    assert!(report.stage_timings_ms.contains_key(Intent::AssembleOutput.as_str()));
    harness.shutdown().await;
}

/// Test: Missing document fails the parse stage permanently
#[tokio::test]
async fn test_missing_document_fails_parse_stage() {
    let harness = Harness::with_providers(
        test_config(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
    );

    let err = harness
        .client()
        .run(DocumentRequest::stored("nope.md"))
        .await
        .unwrap_err();
    match err {
        Error::StageFailed { stage, kind, message } => {
            assert_eq!(stage, "RunWorkflow");
            assert_eq!(kind, ErrorKind::Permanent);
            assert!(message.contains("ParseDocument"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(harness.orchestrator.tracked_tasks(), 0);
    harness.shutdown().await;
}
