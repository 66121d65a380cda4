//! Caller side of a workflow: submit a root request, wait for its result.

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{deadline_after, WorkflowReport};
use crate::broker::{agent_topic, Broker, Subscription};
use crate::config::OrchestratorConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{AgentId, CancelNotice, Envelope, Intent, TaskError, TaskRequest, TaskResult};
use crate::workers::{DocumentRequest, ORCHESTRATOR_AGENT};

pub struct WorkflowClient {
    id: AgentId,
    broker: Broker,
    orchestrator: AgentId,
    timeout: Duration,
    inbox: Mutex<Subscription>,
}

impl WorkflowClient {
    /// Subscribes to the client's own topic right away, so no result
    /// published after this returns can be missed.
    pub fn new(broker: Broker, id: AgentId, config: &OrchestratorConfig) -> Self {
        let inbox = broker.subscribe(&agent_topic(&id));
        Self {
            id,
            broker,
            orchestrator: AgentId::from(ORCHESTRATOR_AGENT),
            timeout: config.workflow_timeout(),
            inbox: Mutex::new(inbox),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: AgentId) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one workflow and return its terminal result as published by the
    /// orchestrator.
    ///
    /// When nothing arrives within the client timeout the root is cancelled
    /// and a `timed_out` result is synthesized locally.
    pub async fn submit(&self, request: DocumentRequest) -> Result<TaskResult> {
        let root = TaskRequest::new(
            self.id.clone(),
            self.orchestrator.clone(),
            Intent::RunWorkflow,
            serde_json::to_value(&request)?,
        )
        .with_deadline(deadline_after(self.timeout));
        let task_id = root.task_id;

        let mut inbox = self.inbox.lock().await;
        self.broker
            .publish(&agent_topic(&self.orchestrator), &Envelope::Request(root))
            .await?;
        info!(task_id = %task_id, doc_id = %request.doc_id, "workflow submitted");

        let wait = async {
            loop {
                match inbox.recv().await {
                    Some(Envelope::Result(result)) if result.task_id == task_id => {
                        return Ok(result);
                    }
                    Some(other) => {
                        debug!(task_id = %task_id, kind = other.kind(), "ignoring unrelated envelope");
                    }
                    None => {
                        return Err(Error::TransportUnavailable(self.broker.endpoint().to_string()));
                    }
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %task_id, timeout = ?self.timeout, "workflow timed out, cancelling");
                let notice = CancelNotice::new(task_id, "client timeout");
                if let Err(err) = self
                    .broker
                    .publish(&agent_topic(&self.orchestrator), &Envelope::Cancel(notice))
                    .await
                {
                    warn!(task_id = %task_id, error = %err, "cancel notice lost");
                }
                Ok(TaskResult::timed_out(
                    task_id,
                    self.orchestrator.clone(),
                    TaskError::new(
                        ErrorKind::Timeout,
                        format!("no result within {:?}", self.timeout),
                    ),
                ))
            }
        }
    }

    /// `submit`, then decode the report. Any unsuccessful root becomes a
    /// `RunWorkflow` stage failure carrying the root's error kind.
    pub async fn run(&self, request: DocumentRequest) -> Result<WorkflowReport> {
        let result = self.submit(request).await?;
        if !result.status.is_success() {
            let (kind, message) = result
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or((ErrorKind::Permanent, result.status.to_string()));
            return Err(Error::StageFailed {
                stage: Intent::RunWorkflow.to_string(),
                kind,
                message,
            });
        }
        let payload = result
            .result
            .ok_or_else(|| Error::malformed("workflow result without payload"))?;
        Ok(serde_json::from_value(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TaskId, TaskStatus};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_client_timeout_cancels_root() {
        let broker = Broker::in_memory();
        let mut orchestrator_inbox = broker.subscribe(&agent_topic(&AgentId::from(ORCHESTRATOR_AGENT)));
        let client = WorkflowClient::new(broker.clone(), AgentId::from("cli"), &OrchestratorConfig::default())
            .with_timeout(Duration::from_millis(500));

        let result = client.submit(DocumentRequest::inline("d", "text")).await.unwrap();
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);

        let Some(Envelope::Request(root)) = orchestrator_inbox.recv().await else {
            panic!("expected the root request");
        };
        assert_eq!(root.task_id, result.task_id);
        assert_eq!(root.intent, Intent::RunWorkflow);
        let Some(Envelope::Cancel(notice)) = orchestrator_inbox.recv().await else {
            panic!("expected a cancel notice");
        };
        assert_eq!(notice.task_id, result.task_id);
    }

    #[tokio::test]
    async fn test_run_maps_failure_to_stage_error() {
        let broker = Broker::in_memory();
        let orchestrator = AgentId::from(ORCHESTRATOR_AGENT);
        let mut orchestrator_inbox = broker.subscribe(&agent_topic(&orchestrator));
        let client = WorkflowClient::new(broker.clone(), AgentId::from("cli"), &OrchestratorConfig::default());

        let responder = tokio::spawn({
            let broker = broker.clone();
            async move {
                let Some(Envelope::Request(root)) = orchestrator_inbox.recv().await else {
                    panic!("expected the root request");
                };
                // An unrelated result first: the client must skip it.
                let stray = TaskResult::completed(TaskId::new(), orchestrator.clone(), json!({}));
                broker.publish(&agent_topic(&root.source_agent), &Envelope::Result(stray)).await.unwrap();
                let failed = TaskResult::failed(
                    root.task_id,
                    orchestrator,
                    TaskError::new(ErrorKind::Transient, "search unavailable"),
                );
                broker.publish(&agent_topic(&root.source_agent), &Envelope::Result(failed)).await.unwrap();
            }
        });

        let err = client.run(DocumentRequest::stored("d")).await.unwrap_err();
        responder.await.unwrap();
        match err {
            Error::StageFailed { stage, kind, message } => {
                assert_eq!(stage, "RunWorkflow");
                assert_eq!(kind, ErrorKind::Transient);
                assert_eq!(message, "search unavailable");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_fails_fast_without_transport() {
        let broker = Broker::in_memory();
        let client = WorkflowClient::new(broker.clone(), AgentId::from("cli"), &OrchestratorConfig::default());
        broker.set_available(false);
        let err = client.submit(DocumentRequest::stored("d")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
