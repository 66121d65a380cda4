//! Verification planning over the broker.

use std::sync::Arc;

use serde_json::{json, Value};

use glossa::broker::{agent_topic, Broker};
use glossa::document::parse_document;
use glossa::planner::{NodeStatus, VerificationPlan, VerificationTask};
use glossa::protocol::{AgentId, Envelope, Intent, TaskRequest, TaskResult, TaskStatus};
use glossa::providers::ExtractiveGenerator;
use glossa::workers::VERIFICATION_AGENT;

use crate::fixtures::{test_config, Harness, ScriptedSearch};

const TEN_NODES: &str = "\
# Release Review

Intro paragraph about the project.

[claim] The scheduler never starves a task.

Background prose with no figures.

More background on the design.

Throughput improved 35% after the rewrite.

Another ordinary paragraph.

[statistic confidence=low] Latency dropped 20% in 2024.

Notes on naming conventions.

Closing remarks for readers.

Acknowledgements and thanks.
";

/// Send one request to the verification agent and wait for its result.
async fn ask(broker: &Broker, intent: Intent, payload: Value) -> TaskResult {
    let me = AgentId::from("planner-test");
    let mut inbox = broker.subscribe(&agent_topic(&me));
    let request = TaskRequest::new(me, AgentId::from(VERIFICATION_AGENT), intent, payload);
    let task_id = request.task_id;
    broker
        .publish(&agent_topic(&AgentId::from(VERIFICATION_AGENT)), &Envelope::Request(request))
        .await
        .unwrap();
    loop {
        match inbox.recv().await {
            Some(Envelope::Result(result)) if result.task_id == task_id => return result,
            Some(_) => continue,
            None => panic!("broker closed"),
        }
    }
}

fn harness(min_confidence: f64, max_nodes_per_task: usize) -> Harness {
    let mut config = test_config();
    config.planner.min_confidence = min_confidence;
    config.planner.max_nodes_per_task = max_nodes_per_task;
    Harness::with_providers(
        config,
        Arc::new(ScriptedSearch::default()),
        Arc::new(ExtractiveGenerator),
    )
}

/// Test: Three of ten nodes form one batch
/// Given min_confidence = 0.5 and ten nodes of which three score at least 0.5
/// When a plan is requested
/// Then exactly one batch holds those three, highest score first
#[tokio::test]
async fn test_three_of_ten_nodes_form_one_batch() {
    let harness = harness(0.5, 10);
    let document = parse_document("review.md", TEN_NODES).unwrap();

    let result = ask(
        &harness.broker,
        Intent::CreateVerificationPlan,
        json!({ "document": document }),
    )
    .await;
    assert_eq!(result.status, TaskStatus::Completed);
    let plan: VerificationPlan = serde_json::from_value(result.result.unwrap()).unwrap();

    assert_eq!(plan.considered, 10);
    assert_eq!(plan.tasks.len(), 1);
    let contents: Vec<_> = plan.tasks[0].nodes.iter().map(|n| n.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "Latency dropped 20% in 2024.",
            "The scheduler never starves a task.",
            "Throughput improved 35% after the rewrite.",
        ]
    );
    harness.shutdown().await;
}

/// Test: Batches are verified against search
/// Given a plan split into batches of two
/// When each batch is sent for verification
/// Then every node comes back verified with its evidence appended
#[tokio::test]
async fn test_batches_are_verified() {
    let harness = harness(0.5, 2);
    let document = parse_document("review.md", TEN_NODES).unwrap();
    let result = ask(
        &harness.broker,
        Intent::CreateVerificationPlan,
        json!({ "document": document }),
    )
    .await;
    let plan: VerificationPlan = serde_json::from_value(result.result.unwrap()).unwrap();
    assert_eq!(plan.tasks.len(), 2);

    for task in plan.tasks {
        let result = ask(
            &harness.broker,
            Intent::BatchVerifyNodes,
            serde_json::to_value(&task).unwrap(),
        )
        .await;
        let verified: VerificationTask = serde_json::from_value(result.result.unwrap()).unwrap();
        assert_eq!(verified.batch, task.batch);
        for (before, after) in task.nodes.iter().zip(&verified.nodes) {
            assert_eq!(after.status, NodeStatus::Verified);
            assert_eq!(after.evidence.len(), before.evidence.len() + 1);
            assert!(after.evidence.last().unwrap().starts_with("source: "));
        }
    }
    harness.shutdown().await;
}

/// Test: A malformed plan request fails permanently
#[tokio::test]
async fn test_malformed_plan_request_fails() {
    let harness = harness(0.5, 10);
    let result = ask(&harness.broker, Intent::CreateVerificationPlan, json!({ "doc": 1 })).await;
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.unwrap().kind, glossa::error::ErrorKind::Permanent);
    assert_eq!(result.attempts, 1);
    harness.shutdown().await;
}
