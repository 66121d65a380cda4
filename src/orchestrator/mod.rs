//! The supervisor agent.
//!
//! Runs the fixed pipeline for one `RunWorkflow` request:
//!
//! ParseDocument -> ExtractEntities -> ResearchEntity (fan-out) -> AssembleOutput
//!
//! Single-worker stages are request/response calls bounded by the stage
//! timeout. The research stage is a bounded fan-out whose children report
//! back on the orchestrator's own topic; every child result is routed to the
//! waiter registered for its `task_id`.

mod client;
mod fanout;
mod pipeline;

pub use client::WorkflowClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::broker::{agent_topic, Broker};
use crate::config::{AggregationConfig, OrchestratorConfig};
use crate::document::OutputDocument;
use crate::error::Result;
use crate::protocol::{
    AgentId, CancelNotice, Envelope, Intent, TaskId, TaskRegistry, TaskRequest, TaskResult,
    TaskState,
};
use crate::runtime::{Agent, Outcome, RetryPolicy, TaskContext};
use crate::workers::{Routes, ORCHESTRATOR_AGENT};

/// Wall-clock deadline `after` from now, saturating far in the future.
pub(crate) fn deadline_after(after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Root result payload of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub output: OutputDocument,
    #[serde(default)]
    pub affected_entities: Vec<String>,
    /// Wall-clock milliseconds spent in each stage, keyed by intent.
    #[serde(default)]
    pub stage_timings_ms: BTreeMap<String, u64>,
}

enum Waiter {
    Stage(oneshot::Sender<TaskResult>),
    Child(mpsc::UnboundedSender<TaskResult>),
}

/// Routes results arriving on the orchestrator topic to whoever awaits them.
/// The first terminal result per task wins; the waiter is removed with it.
#[derive(Default)]
pub(crate) struct Waiters {
    inner: Mutex<HashMap<TaskId, Waiter>>,
}

impl Waiters {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Waiter>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn stage(&self, task_id: TaskId) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(task_id, Waiter::Stage(tx));
        rx
    }

    pub(crate) fn child(&self, task_id: TaskId, collector: mpsc::UnboundedSender<TaskResult>) {
        self.lock().insert(task_id, Waiter::Child(collector));
    }

    pub(crate) fn remove(&self, task_id: &TaskId) {
        self.lock().remove(task_id);
    }

    fn deliver(&self, result: TaskResult) -> bool {
        let waiter = self.lock().remove(&result.task_id);
        match waiter {
            Some(Waiter::Stage(tx)) => tx.send(result).is_ok(),
            Some(Waiter::Child(tx)) => tx.send(result).is_ok(),
            None => {
                debug!(task_id = %result.task_id, "result without waiter dropped");
                false
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Move a tracked task to `target`. A task still `Dispatched` passes
/// through `Running` on completion, since only the worker observed it.
pub(crate) fn settle_task(registry: &Mutex<TaskRegistry>, task_id: &TaskId, target: TaskState) {
    let mut registry = registry.lock().unwrap_or_else(|p| p.into_inner());
    if target == TaskState::Completed && registry.state(task_id) == Some(TaskState::Dispatched) {
        let _ = registry.transition(task_id, TaskState::Running);
    }
    if let Err(err) = registry.transition(task_id, target) {
        debug!(task_id = %task_id, error = %err, "task not settled");
    }
}

/// Tasks dispatched on behalf of one root that have not reported yet.
///
/// Dropping it unregisters their waiters and sends each a cancel notice.
/// That happens on every stage exit, including when the runtime drops the
/// workflow future because the root itself was cancelled.
pub(crate) struct Outstanding {
    broker: Broker,
    waiters: Arc<Waiters>,
    reason: String,
    tasks: HashMap<TaskId, AgentId>,
}

impl Outstanding {
    pub(crate) fn new(broker: Broker, waiters: Arc<Waiters>, reason: impl Into<String>) -> Self {
        Self {
            broker,
            waiters,
            reason: reason.into(),
            tasks: HashMap::new(),
        }
    }

    pub(crate) fn track(&mut self, task_id: TaskId, target: AgentId) {
        self.tasks.insert(task_id, target);
    }

    /// Returns `true` if `task_id` was still outstanding.
    pub(crate) fn settle(&mut self, task_id: &TaskId) -> bool {
        self.tasks.remove(task_id).is_some()
    }

    pub(crate) fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let waiters = &self.waiters;
        let reason = &self.reason;
        let notices: Vec<(String, Envelope)> = self
            .tasks
            .drain()
            .map(|(task_id, target)| {
                waiters.remove(&task_id);
                (
                    agent_topic(&target),
                    Envelope::Cancel(CancelNotice::new(task_id, reason.clone())),
                )
            })
            .collect();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(count = notices.len(), "no runtime, cancel notices not sent");
            return;
        };
        let broker = self.broker.clone();
        runtime.spawn(async move {
            for (topic, notice) in notices {
                if let Err(err) = broker.publish(&topic, &notice).await {
                    warn!(topic = %topic, task_id = ?notice.task_id(), error = %err, "cancel notice lost");
                }
            }
        });
    }
}

pub struct Orchestrator {
    id: AgentId,
    config: OrchestratorConfig,
    aggregation: AggregationConfig,
    routes: Routes,
    publish_policy: RetryPolicy,
    waiters: Arc<Waiters>,
    registry: Arc<Mutex<TaskRegistry>>,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig, aggregation: &AggregationConfig) -> Self {
        Self {
            id: AgentId::from(ORCHESTRATOR_AGENT),
            config: config.clone(),
            aggregation: aggregation.clone(),
            routes: Routes::default(),
            publish_policy: RetryPolicy::default(),
            waiters: Arc::new(Waiters::default()),
            registry: Arc::new(Mutex::new(TaskRegistry::new())),
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_routes(mut self, routes: Routes) -> Self {
        self.routes = routes;
        self
    }

    /// Backoff for publishing stage and child requests.
    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Results still awaited by running workflows.
    pub fn pending_results(&self) -> usize {
        self.waiters.len()
    }

    /// Tasks tracked by running workflows, roots included.
    pub fn tracked_tasks(&self) -> usize {
        self.registry.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl Agent for Orchestrator {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn handles(&self, intent: &Intent) -> bool {
        *intent == Intent::RunWorkflow
    }

    async fn handle(&self, ctx: TaskContext, request: &TaskRequest) -> Result<Outcome> {
        self.run_workflow(ctx, request).await
    }

    async fn on_result(&self, result: TaskResult) {
        self.waiters.deliver(result);
    }

    fn task_timeout(&self) -> Option<Duration> {
        Some(self.config.workflow_timeout())
    }

    /// A workflow is never re-run: children already carry their own retries.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::none())
    }
}
