//! The research fan-out.
//!
//! One `ResearchEntity` child per distinct candidate, at most
//! `fanout_concurrency` in flight. Every child is registered with the
//! aggregator before anything is sent, so the barrier is simply the
//! aggregator's pending count: it drops on each terminal child result and
//! reaches zero at the latest when the stage deadline times out everything
//! still owed, dispatched or not.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{deadline_after, settle_task, Orchestrator, Outstanding, Waiters};
use crate::aggregate::{normalize_entity, AggregateReport, Aggregator};
use crate::broker::{agent_topic, Ack, Broker};
use crate::config::AggregationConfig;
use crate::document::CandidateEntity;
use crate::error::{Error, Result};
use crate::protocol::{
    AgentId, Envelope, Intent, TaskError, TaskId, TaskRegistry, TaskRequest, TaskResult,
    TaskState,
};
use crate::runtime::RetryPolicy;
use crate::workers::ResearchRequest;

/// Drop repeated candidates: same normalized name in the same context.
pub(crate) fn dedup_candidates(candidates: Vec<CandidateEntity>) -> Vec<CandidateEntity> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !normalize_entity(&c.name).is_empty())
        .filter(|c| seen.insert((normalize_entity(&c.name), c.context.clone())))
        .collect()
}

pub(crate) struct FanOut {
    broker: Broker,
    source: AgentId,
    target: AgentId,
    concurrency: usize,
    stage_deadline: Duration,
    aggregation: AggregationConfig,
    publish_policy: RetryPolicy,
    waiters: Arc<Waiters>,
    registry: Arc<Mutex<TaskRegistry>>,
}

impl FanOut {
    pub(crate) fn new(orchestrator: &Orchestrator, broker: Broker) -> Self {
        Self {
            broker,
            source: orchestrator.id.clone(),
            target: orchestrator.routes.research.clone(),
            concurrency: orchestrator.config.fanout_concurrency.max(1),
            stage_deadline: orchestrator.config.stage_deadline(),
            aggregation: orchestrator.aggregation.clone(),
            publish_policy: orchestrator.publish_policy,
            waiters: Arc::clone(&orchestrator.waiters),
            registry: Arc::clone(&orchestrator.registry),
        }
    }

    /// Dispatch, collect and aggregate. Returns within the stage deadline
    /// whatever the children do; only root cancellation or an invalid
    /// parent aborts it.
    pub(crate) async fn run(
        &self,
        cancel: &CancellationToken,
        root: TaskId,
        candidates: Vec<CandidateEntity>,
    ) -> Result<AggregateReport> {
        let deadline = Instant::now() + self.stage_deadline;
        let wall_deadline = deadline_after(self.stage_deadline);
        let mut aggregator = Aggregator::new(self.aggregation.clone());
        let (collector, mut results) = mpsc::unbounded_channel();
        let mut outstanding = Outstanding::new(
            self.broker.clone(),
            Arc::clone(&self.waiters),
            format!("parent {root} cancelled"),
        );

        let mut queue = VecDeque::new();
        for candidate in dedup_candidates(candidates) {
            let payload = serde_json::to_value(ResearchRequest {
                entity: candidate.name.clone(),
                context: candidate.context,
            })?;
            let child = TaskRequest::new(
                self.source.clone(),
                self.target.clone(),
                Intent::ResearchEntity,
                payload,
            )
            .with_parent(root)
            .with_deadline(wall_deadline);
            self.registry
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .register_child(child.task_id, root)?;
            aggregator.expect(child.task_id, candidate.name);
            queue.push_back(child);
        }
        info!(
            task_id = %root,
            children = queue.len(),
            concurrency = self.concurrency,
            deadline = ?self.stage_deadline,
            "research fan-out started"
        );

        let mut in_flight = 0;
        let mut expired = false;
        'stage: loop {
            while in_flight < self.concurrency {
                let Some(child) = queue.pop_front() else { break };
                match self.dispatch(child, &collector, cancel, deadline).await {
                    Dispatch::Sent(task_id) => {
                        outstanding.track(task_id, self.target.clone());
                        in_flight += 1;
                    }
                    Dispatch::Failed(task_id, err) => {
                        aggregator.mark_failed(task_id, TaskError::from(&err));
                        settle_task(&self.registry, &task_id, TaskState::Failed);
                    }
                    Dispatch::Cancelled => {
                        warn!(task_id = %root, outstanding = outstanding.len(), "fan-out cancelled during dispatch");
                        return Err(Error::Cancelled(root));
                    }
                    Dispatch::Expired => {
                        expired = true;
                        break 'stage;
                    }
                }
            }
            if aggregator.is_complete() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(task_id = %root, outstanding = outstanding.len(), "fan-out cancelled");
                    return Err(Error::Cancelled(root));
                }
                Some(result) = results.recv() => {
                    let task_id = result.task_id;
                    let state = TaskState::from(result.status);
                    if aggregator.accept(result) {
                        outstanding.settle(&task_id);
                        settle_task(&self.registry, &task_id, state);
                        in_flight -= 1;
                        debug!(task_id = %task_id, pending = aggregator.pending(), "child settled");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    expired = true;
                    break;
                }
            }
        }

        if expired {
            let timed_out = aggregator.time_out_remaining();
            for task_id in &timed_out {
                settle_task(&self.registry, task_id, TaskState::TimedOut);
            }
            warn!(
                task_id = %root,
                timed_out = timed_out.len(),
                undispatched = queue.len(),
                "stage deadline elapsed, proceeding with partial results"
            );
            outstanding.set_reason("stage deadline elapsed");
        }

        // Dropping `outstanding` cancels children still running past the deadline.
        drop(outstanding);
        let report = aggregator.finish();
        info!(
            task_id = %root,
            definitions = report.definitions.len(),
            affected = report.affected_entities.len(),
            "research fan-out finished"
        );
        Ok(report)
    }

    /// Publish one child, racing the publish backoff against root
    /// cancellation and the stage deadline.
    async fn dispatch(
        &self,
        child: TaskRequest,
        collector: &mpsc::UnboundedSender<TaskResult>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Dispatch {
        let task_id = child.task_id;
        self.waiters.child(task_id, collector.clone());
        settle_task(&self.registry, &task_id, TaskState::Dispatched);

        let topic = agent_topic(&self.target);
        let envelope = Envelope::Request(child);
        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => {
                self.waiters.remove(&task_id);
                return Dispatch::Expired;
            }
            published = self.broker.publish_with_retry(&topic, &envelope, &self.publish_policy) => Some(published),
        };

        match published {
            None => {
                self.waiters.remove(&task_id);
                Dispatch::Cancelled
            }
            Some(Ok(ack)) => {
                if ack == Ack::NoSubscribers {
                    warn!(task_id = %task_id, target = %self.target, "no worker subscribed, child will time out");
                }
                Dispatch::Sent(task_id)
            }
            Some(Err(err)) => {
                warn!(task_id = %task_id, error = %err, "child dispatch failed");
                self.waiters.remove(&task_id);
                Dispatch::Failed(task_id, err)
            }
        }
    }
}

/// How one child's dispatch ended.
enum Dispatch {
    Sent(TaskId),
    Failed(TaskId, Error),
    Cancelled,
    /// The stage deadline passed while the publish was still backing off.
    Expired,
}
