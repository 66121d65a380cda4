//! Verification planning and batch verification.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{DocumentPayload, VERIFICATION_AGENT};
use crate::config::PlannerConfig;
use crate::error::{Error, Result};
use crate::planner::{NodeStatus, VerificationPlanner, VerificationTask};
use crate::protocol::{AgentId, Intent, TaskRequest};
use crate::providers::SearchProvider;
use crate::runtime::{Agent, Outcome, TaskContext};

const HITS_PER_NODE: usize = 2;
const QUERY_WORDS: usize = 16;

pub struct VerificationAgent {
    id: AgentId,
    planner: VerificationPlanner,
    search: Arc<dyn SearchProvider>,
}

impl VerificationAgent {
    pub fn new(search: Arc<dyn SearchProvider>, config: &PlannerConfig) -> Self {
        Self {
            id: AgentId::from(VERIFICATION_AGENT),
            planner: VerificationPlanner::new(config),
            search,
        }
    }

    pub fn with_planner(mut self, planner: VerificationPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Check each node against the search provider. A hit verifies the node
    /// and is appended to its evidence; no hit skips it.
    pub async fn verify(&self, mut task: VerificationTask) -> Result<VerificationTask> {
        for node in &mut task.nodes {
            let query = node
                .content
                .split_whitespace()
                .take(QUERY_WORDS)
                .collect::<Vec<_>>()
                .join(" ");
            let hits = self.search.search(&query, HITS_PER_NODE).await?;
            if hits.is_empty() {
                node.status = NodeStatus::Skipped;
                continue;
            }
            node.status = NodeStatus::Verified;
            node.evidence
                .extend(hits.into_iter().map(|h| format!("source: {}", h.title)));
        }
        debug!(
            batch = task.batch,
            verified = task.nodes.iter().filter(|n| n.status == NodeStatus::Verified).count(),
            "batch verified"
        );
        Ok(task)
    }
}

#[async_trait]
impl Agent for VerificationAgent {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn handles(&self, intent: &Intent) -> bool {
        matches!(intent, Intent::CreateVerificationPlan | Intent::BatchVerifyNodes)
    }

    async fn handle(&self, _ctx: TaskContext, request: &TaskRequest) -> Result<Outcome> {
        match request.intent {
            Intent::CreateVerificationPlan => {
                let DocumentPayload { document } = request.payload_as()?;
                let plan = self.planner.plan(&document);
                Ok(serde_json::to_value(plan)?.into())
            }
            Intent::BatchVerifyNodes => {
                let task: VerificationTask = request.payload_as()?;
                Ok(serde_json::to_value(self.verify(task).await?)?.into())
            }
            _ => Err(Error::UnknownIntent(request.intent.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::document::parse_document;
    use crate::planner::VerificationPlan;
    use crate::providers::CorpusSearch;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn agent() -> VerificationAgent {
        let mut search = CorpusSearch::new();
        search.add_document("bench.md", "The scheduler benchmark shows throughput improved 35%.");
        VerificationAgent::new(Arc::new(search), &PlannerConfig::default())
    }

    fn ctx() -> TaskContext {
        TaskContext {
            broker: Broker::in_memory(),
            agent_id: AgentId::from(VERIFICATION_AGENT),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_plan_then_verify_batch() {
        let agent = agent();
        let doc = parse_document(
            "d",
            "[claim] Throughput improved 35% after the rewrite.\n\n[claim] Zebras prefer oolong.",
        )
        .unwrap();
        let request = TaskRequest::new(
            AgentId::from("client"),
            AgentId::from(VERIFICATION_AGENT),
            Intent::CreateVerificationPlan,
            json!({"document": doc}),
        );
        let plan = match agent.handle(ctx(), &request).await.unwrap() {
            Outcome::Completed(v) => serde_json::from_value::<VerificationPlan>(v).unwrap(),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(plan.tasks.len(), 1);

        let verified = agent.verify(plan.tasks[0].clone()).await.unwrap();
        let statuses: Vec<_> = verified.nodes.iter().map(|n| n.status).collect();
        assert_eq!(statuses, vec![NodeStatus::Verified, NodeStatus::Skipped]);
        assert!(verified.nodes[0].evidence.contains(&"source: bench.md #1".to_string()));
    }

    #[tokio::test]
    async fn test_batch_payload_must_be_a_task() {
        let request = TaskRequest::new(
            AgentId::from("client"),
            AgentId::from(VERIFICATION_AGENT),
            Intent::BatchVerifyNodes,
            json!({"nodes": "nope"}),
        );
        let err = agent().handle(ctx(), &request).await.unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }
}
