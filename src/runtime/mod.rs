//! Agent runtime: the execution shell around every task handler.
//!
//! A runtime subscribes to its agent's topic and runs two independent
//! loops: the task loop (receive, dispatch by intent, execute with a
//! per-task timeout and retry policy, publish one terminal result) and the
//! heartbeat loop (publish load on a fixed interval regardless of backlog).
//!
//! State: Starting -> Running -> Stopping -> Stopped

mod heartbeat;
mod liveness;
mod retry;

use heartbeat::HeartbeatActor;
pub use liveness::{AgentHealth, LivenessEvent, LivenessMonitor};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{agent_topic, Broker, Subscription, TtlSet};
use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{
    AgentId, CancelNotice, Envelope, Intent, TaskError, TaskId, TaskRequest, TaskResult,
};

/// How long a finished task id is remembered to drop late duplicates.
const FINISHED_TTL: Duration = Duration::from_secs(600);
const FINISHED_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Successful handler output.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    /// Usable result with a recorded partial failure.
    CompletedWithErrors(Value),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Completed(value)
    }
}

/// Per-invocation context handed to a handler.
#[derive(Clone)]
pub struct TaskContext {
    pub broker: Broker,
    pub agent_id: AgentId,
    /// 1-based handler invocation count for this task.
    pub attempt: u32,
    /// Fires when a cancel notice for this task arrives.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn id(&self) -> AgentId;

    /// Whether this agent serves `intent`. Anything else fails permanently.
    fn handles(&self, intent: &Intent) -> bool;

    async fn handle(&self, ctx: TaskContext, request: &TaskRequest) -> Result<Outcome>;

    /// Results addressed to this agent (answers to requests it sent).
    async fn on_result(&self, _result: TaskResult) {}

    /// Overrides the configured per-task timeout.
    fn task_timeout(&self) -> Option<Duration> {
        None
    }

    /// Overrides the configured retry policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// In-flight and recently finished task ids for exactly-once results.
pub(crate) struct InFlight {
    running: Mutex<HashMap<TaskId, CancellationToken>>,
    finished: TtlSet<TaskId>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            finished: TtlSet::new(FINISHED_TTL, FINISHED_CAPACITY),
        }
    }

    /// Claim `task_id`. `None` when it is already running or finished.
    fn begin(&self, task_id: TaskId) -> Option<CancellationToken> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.contains_key(&task_id) || self.finished.contains(&task_id) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(task_id, token.clone());
        Some(token)
    }

    /// Release `task_id`. Returns `true` only for the claim holder's first call.
    fn finish(&self, task_id: &TaskId) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        self.finished.insert(*task_id);
        running.remove(task_id).is_some()
    }

    fn cancel(&self, task_id: &TaskId) -> bool {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        match running.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.values().for_each(CancellationToken::cancel);
    }

    pub(crate) fn len(&self) -> usize {
        self.running.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

struct Shared {
    agent: Arc<dyn Agent>,
    agent_id: AgentId,
    broker: Broker,
    in_flight: Arc<InFlight>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    task_timeout: Duration,
}

impl Shared {
    fn accept(self: &Arc<Self>, request: TaskRequest, tasks: &mut JoinSet<()>) {
        let Some(cancel) = self.in_flight.begin(request.task_id) else {
            debug!(agent = %self.agent_id, task_id = %request.task_id, "duplicate task dropped");
            return;
        };

        let shared = Arc::clone(self);
        if !self.agent.handles(&request.intent) {
            tasks.spawn(async move {
                let err = Error::UnknownIntent(request.intent.clone());
                warn!(agent = %shared.agent_id, task_id = %request.task_id, error = %err, "rejecting task");
                let result =
                    TaskResult::failed(request.task_id, shared.agent_id.clone(), TaskError::from(&err));
                shared.finish_and_publish(&request, Some(result)).await;
            });
            return;
        }

        tasks.spawn(async move {
            let result = shared.run_task(&request, cancel).await;
            shared.finish_and_publish(&request, result).await;
        });
    }

    /// Execute with retries. `None` means cancelled: publish nothing.
    async fn run_task(&self, request: &TaskRequest, cancel: CancellationToken) -> Option<TaskResult> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
        };

        let task_id = request.task_id;
        info!(agent = %self.agent_id, task_id = %task_id, intent = %request.intent, "task started");

        let mut retries = 0;
        loop {
            let attempt = retries + 1;
            let budget = match request.remaining() {
                Some(left) => left.min(self.task_timeout),
                None => self.task_timeout,
            };
            if budget.is_zero() {
                let err = Error::Timeout(Duration::ZERO);
                warn!(agent = %self.agent_id, task_id = %task_id, "deadline passed before attempt");
                return Some(
                    TaskResult::timed_out(task_id, self.agent_id.clone(), TaskError::from(&err))
                        .with_attempts(retries),
                );
            }

            let ctx = TaskContext {
                broker: self.broker.clone(),
                agent_id: self.agent_id.clone(),
                attempt,
                cancel: cancel.clone(),
            };
            let call = AssertUnwindSafe(self.agent.handle(ctx, request)).catch_unwind();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                res = tokio::time::timeout(budget, call) => match res {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_panic)) => Err(Error::TaskJoin(format!("handler for {} panicked", request.intent))),
                    Err(_) => Err(Error::Timeout(budget)),
                },
            };

            match outcome {
                Ok(Outcome::Completed(value)) => {
                    info!(agent = %self.agent_id, task_id = %task_id, attempt, "task completed");
                    return Some(
                        TaskResult::completed(task_id, self.agent_id.clone(), value).with_attempts(attempt),
                    );
                }
                Ok(Outcome::CompletedWithErrors(value)) => {
                    info!(agent = %self.agent_id, task_id = %task_id, attempt, "task completed with errors");
                    return Some(
                        TaskResult::completed_with_errors(task_id, self.agent_id.clone(), value)
                            .with_attempts(attempt),
                    );
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => return None,
                Err(err) if self.policy.should_retry(err.kind(), retries) => {
                    let delay = self.policy.delay(retries);
                    warn!(
                        agent = %self.agent_id,
                        task_id = %task_id,
                        attempt,
                        ?delay,
                        error = %err,
                        "retryable failure"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retries += 1;
                }
                Err(err) => {
                    warn!(agent = %self.agent_id, task_id = %task_id, attempt, error = %err, "task failed");
                    let error = TaskError::from(&err);
                    let result = if err.kind() == ErrorKind::Timeout {
                        TaskResult::timed_out(task_id, self.agent_id.clone(), error)
                    } else {
                        TaskResult::failed(task_id, self.agent_id.clone(), error)
                    };
                    return Some(result.with_attempts(attempt));
                }
            }
        }
    }

    async fn finish_and_publish(&self, request: &TaskRequest, result: Option<TaskResult>) {
        if !self.in_flight.finish(&request.task_id) {
            return;
        }
        let Some(result) = result else {
            info!(agent = %self.agent_id, task_id = %request.task_id, "task cancelled, no result");
            return;
        };
        let topic = agent_topic(&request.source_agent);
        let status = result.status;
        if let Err(err) = self
            .broker
            .publish_with_retry(&topic, &Envelope::Result(result), &self.policy)
            .await
        {
            error!(agent = %self.agent_id, task_id = %request.task_id, error = %err, "result lost");
        } else {
            debug!(agent = %self.agent_id, task_id = %request.task_id, %status, "result published");
        }
    }

    fn on_cancel(&self, notice: &CancelNotice) {
        if self.in_flight.cancel(&notice.task_id) {
            info!(agent = %self.agent_id, task_id = %notice.task_id, reason = %notice.reason, "cancelling task");
        } else {
            debug!(agent = %self.agent_id, task_id = %notice.task_id, "cancel for unknown task ignored");
        }
    }
}

/// Builder for one agent's runtime.
pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    broker: Broker,
    config: RuntimeConfig,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, broker: Broker, config: &RuntimeConfig) -> Self {
        Self {
            agent,
            broker,
            config: config.clone(),
        }
    }

    /// Subscribe and start both loops. Requests published after this
    /// returns are never missed.
    pub fn spawn(self) -> RuntimeHandle {
        let agent_id = self.agent.id();
        let subscription = self.broker.subscribe(&agent_topic(&agent_id));
        let (state_tx, state_rx) = watch::channel(RuntimeState::Starting);
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(InFlight::new());

        let shared = Arc::new(Shared {
            policy: self
                .agent
                .retry_policy()
                .unwrap_or_else(|| RetryPolicy::from_config(&self.config)),
            task_timeout: self
                .agent
                .task_timeout()
                .unwrap_or_else(|| self.config.task_timeout()),
            agent: self.agent,
            agent_id: agent_id.clone(),
            broker: self.broker.clone(),
            in_flight: Arc::clone(&in_flight),
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1))),
        });

        let heartbeat = HeartbeatActor::new(
            self.broker,
            agent_id.clone(),
            Arc::clone(&in_flight),
            self.config.heartbeat_interval(),
        );

        debug!(agent = %agent_id, "AgentRuntime::spawn");
        let join = tokio::spawn(task_loop(
            shared,
            subscription,
            heartbeat,
            state_tx,
            shutdown.clone(),
            self.config.task_timeout(),
        ));

        RuntimeHandle {
            agent_id,
            state: state_rx,
            shutdown,
            in_flight,
            join,
        }
    }
}

async fn task_loop(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    heartbeat: HeartbeatActor,
    state: watch::Sender<RuntimeState>,
    shutdown: CancellationToken,
    drain_grace: Duration,
) {
    let heartbeat = heartbeat.spawn(shutdown.child_token());
    let mut tasks = JoinSet::new();
    let _ = state.send(RuntimeState::Running);
    info!(agent = %shared.agent_id, "runtime running");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    error!(agent = %shared.agent_id, error = %err, "task join failed");
                }
            }
            envelope = subscription.recv() => match envelope {
                Some(Envelope::Request(request)) => shared.accept(request, &mut tasks),
                Some(Envelope::Cancel(notice)) => shared.on_cancel(&notice),
                Some(Envelope::Result(result)) => shared.agent.on_result(result).await,
                Some(Envelope::Heartbeat(_)) => {}
                None => {
                    debug!(agent = %shared.agent_id, "subscription closed");
                    break;
                }
            }
        }
    }

    let _ = state.send(RuntimeState::Stopping);
    info!(agent = %shared.agent_id, in_flight = tasks.len(), "runtime stopping");
    shutdown.cancel();

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(drain_grace, drain).await.is_err() {
        warn!(agent = %shared.agent_id, "drain grace elapsed, cancelling in-flight tasks");
        shared.in_flight.cancel_all();
        while tasks.join_next().await.is_some() {}
    }
    let _ = heartbeat.await;

    let _ = state.send(RuntimeState::Stopped);
    info!(agent = %shared.agent_id, "runtime stopped");
}

/// Control handle for a spawned runtime.
pub struct RuntimeHandle {
    agent_id: AgentId,
    state: watch::Receiver<RuntimeState>,
    shutdown: CancellationToken,
    in_flight: Arc<InFlight>,
    join: JoinHandle<()>,
}

impl RuntimeHandle {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RuntimeState> {
        self.state.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop both loops and wait for in-flight work to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))
    }
}
