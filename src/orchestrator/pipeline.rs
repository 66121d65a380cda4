//! Stage sequencing for one workflow run.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use super::fanout::FanOut;
use super::{deadline_after, settle_task, Orchestrator, Outstanding, WorkflowReport};
use crate::broker::agent_topic;
use crate::document::{OutputDocument, ParsedDocument};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Envelope, Intent, TaskId, TaskRegistry, TaskRequest, TaskState};
use crate::runtime::{Outcome, TaskContext};
use crate::workers::{AssembleRequest, DocumentPayload, DocumentRequest, ExtractedEntities};

/// Forgets a root and its children when the workflow ends, however it ends.
struct TrackedRoot {
    registry: Arc<Mutex<TaskRegistry>>,
    root: TaskId,
}

impl Drop for TrackedRoot {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove_tree(&self.root);
    }
}

fn stage_failed(intent: &Intent, kind: ErrorKind, message: impl Into<String>) -> Error {
    Error::StageFailed {
        stage: intent.to_string(),
        kind,
        message: message.into(),
    }
}

impl Orchestrator {
    pub(super) async fn run_workflow(&self, ctx: TaskContext, request: &TaskRequest) -> Result<Outcome> {
        let root = request.task_id;
        let source: DocumentRequest = request.payload_as()?;
        {
            let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            registry.register_root(root);
            registry.transition(&root, TaskState::Dispatched)?;
            registry.transition(&root, TaskState::Running)?;
        }
        let _tracked = TrackedRoot {
            registry: Arc::clone(&self.registry),
            root,
        };
        info!(task_id = %root, doc_id = %source.doc_id, "workflow started");

        let mut timings = BTreeMap::new();

        let started = Instant::now();
        let document: ParsedDocument = self
            .call_stage(&ctx, root, Intent::ParseDocument, serde_json::to_value(&source)?)
            .await?;
        timings.insert(Intent::ParseDocument.to_string(), elapsed_ms(started));

        let started = Instant::now();
        let ExtractedEntities { candidates } = self
            .call_stage(
                &ctx,
                root,
                Intent::ExtractEntities,
                serde_json::to_value(DocumentPayload {
                    document: document.clone(),
                })?,
            )
            .await?;
        timings.insert(Intent::ExtractEntities.to_string(), elapsed_ms(started));

        let started = Instant::now();
        let report = FanOut::new(self, ctx.broker.clone())
            .run(&ctx.cancel, root, candidates)
            .await?;
        timings.insert(Intent::ResearchEntity.to_string(), elapsed_ms(started));

        let started = Instant::now();
        let output: OutputDocument = self
            .call_stage(
                &ctx,
                root,
                Intent::AssembleOutput,
                serde_json::to_value(AssembleRequest {
                    doc_id: document.doc_id.clone(),
                    title: document.title.clone(),
                    definitions: report.definitions,
                    affected_entities: report.affected_entities.clone(),
                })?,
            )
            .await?;
        timings.insert(Intent::AssembleOutput.to_string(), elapsed_ms(started));

        let partial = !report.affected_entities.is_empty();
        info!(
            task_id = %root,
            entities = output.summary.total,
            affected = report.affected_entities.len(),
            "workflow finished"
        );
        let payload = serde_json::to_value(WorkflowReport {
            output,
            affected_entities: report.affected_entities,
            stage_timings_ms: timings,
        })?;
        Ok(if partial {
            Outcome::CompletedWithErrors(payload)
        } else {
            Outcome::Completed(payload)
        })
    }

    /// Request/response call to the document worker, bounded by the stage
    /// timeout. Anything but a completed result fails the stage with the
    /// originating error kind.
    async fn call_stage<T: DeserializeOwned>(
        &self,
        ctx: &TaskContext,
        root: TaskId,
        intent: Intent,
        payload: Value,
    ) -> Result<T> {
        let timeout = self.config.stage_timeout();
        let target = self.routes.document.clone();
        let request = TaskRequest::new(self.id.clone(), target.clone(), intent.clone(), payload)
            .with_parent(root)
            .with_deadline(deadline_after(timeout));
        let task_id = request.task_id;

        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .register_child(task_id, root)?;
        let reply = self.waiters.stage(task_id);
        let mut outstanding = Outstanding::new(
            ctx.broker.clone(),
            Arc::clone(&self.waiters),
            format!("{intent} stage abandoned"),
        );
        outstanding.track(task_id, target.clone());
        settle_task(&self.registry, &task_id, TaskState::Dispatched);

        // One deadline bounds both the publish backoff and the reply.
        let deadline = Instant::now() + timeout;
        let envelope = Envelope::Request(request);
        let topic = agent_topic(&target);
        let published = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled(root)),
            _ = tokio::time::sleep_until(deadline) => None,
            published = ctx.broker.publish_with_retry(&topic, &envelope, &self.publish_policy) => Some(published),
        };
        match published {
            None => {
                warn!(task_id = %root, stage = %intent, ?timeout, "stage timed out while publishing");
                settle_task(&self.registry, &task_id, TaskState::TimedOut);
                return Err(stage_failed(
                    &intent,
                    ErrorKind::Timeout,
                    format!("not published within {timeout:?}"),
                ));
            }
            Some(Err(err)) => {
                outstanding.settle(&task_id);
                self.waiters.remove(&task_id);
                settle_task(&self.registry, &task_id, TaskState::Failed);
                return Err(stage_failed(&intent, err.kind(), err.to_string()));
            }
            Some(Ok(_)) => {}
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled(root)),
            reply = tokio::time::timeout_at(deadline, reply) => match reply {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    return Err(stage_failed(&intent, ErrorKind::Transient, "reply channel closed"));
                }
                Err(_) => {
                    warn!(task_id = %root, stage = %intent, ?timeout, "stage timed out");
                    settle_task(&self.registry, &task_id, TaskState::TimedOut);
                    return Err(stage_failed(
                        &intent,
                        ErrorKind::Timeout,
                        format!("no result within {timeout:?}"),
                    ));
                }
            },
        };
        outstanding.settle(&task_id);
        settle_task(&self.registry, &task_id, result.status.into());

        if !result.status.is_success() {
            let (kind, message) = result
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or((ErrorKind::Permanent, result.status.to_string()));
            return Err(stage_failed(&intent, kind, message));
        }
        serde_json::from_value(result.result.unwrap_or_default()).map_err(|e| {
            stage_failed(&intent, ErrorKind::Permanent, format!("undecodable result: {e}"))
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
