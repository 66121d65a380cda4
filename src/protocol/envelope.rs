//! Task envelope model: requests, results, heartbeats and cancel notices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{AgentId, Intent, MessageId, TaskId};
use crate::error::{Error, ErrorKind, Result};

/// A unit of work addressed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub message_id: MessageId,
    pub source_agent: AgentId,
    pub target_agent: AgentId,
    pub intent: Intent,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(source: AgentId, target: AgentId, intent: Intent, payload: Value) -> Self {
        Self {
            task_id: TaskId::new(),
            message_id: MessageId::new(),
            source_agent: source,
            target_agent: target,
            intent,
            payload,
            parent_task_id: None,
            created_at: Utc::now(),
            deadline: None,
        }
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left before the deadline, `None` when no deadline is set.
    /// An elapsed deadline yields `Some(Duration::ZERO)`.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Decode the payload into a typed structure. Failures are permanent.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::malformed(format!("{} payload: {}", self.intent, e))
        })
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    TimedOut,
    CompletedWithErrors,
}

impl TaskStatus {
    /// Whether the task produced a usable result.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::CompletedWithErrors)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
            TaskStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
        }
    }
}

/// Structured error carried on a result. Raw errors never cross agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub message_id: MessageId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Handler invocations spent on this task, retries included.
    #[serde(default)]
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    fn terminal(
        task_id: TaskId,
        agent_id: AgentId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Self {
        Self {
            task_id,
            message_id: MessageId::new(),
            agent_id,
            status,
            result,
            error,
            attempts: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn completed(task_id: TaskId, agent_id: AgentId, result: Value) -> Self {
        Self::terminal(task_id, agent_id, TaskStatus::Completed, Some(result), None)
    }

    pub fn completed_with_errors(task_id: TaskId, agent_id: AgentId, result: Value) -> Self {
        Self::terminal(
            task_id,
            agent_id,
            TaskStatus::CompletedWithErrors,
            Some(result),
            None,
        )
    }

    pub fn failed(task_id: TaskId, agent_id: AgentId, error: TaskError) -> Self {
        Self::terminal(task_id, agent_id, TaskStatus::Failed, None, Some(error))
    }

    pub fn timed_out(task_id: TaskId, agent_id: AgentId, error: TaskError) -> Self {
        Self::terminal(task_id, agent_id, TaskStatus::TimedOut, None, Some(error))
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Liveness signal. Never mutates task state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub message_id: MessageId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// In-flight task count at the time of the beat.
    pub load: usize,
}

impl Heartbeat {
    pub fn new(agent_id: AgentId, load: usize) -> Self {
        Self {
            message_id: MessageId::new(),
            agent_id,
            timestamp: Utc::now(),
            load,
        }
    }
}

/// Best-effort request to abort an in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelNotice {
    pub message_id: MessageId,
    pub task_id: TaskId,
    pub reason: String,
}

impl CancelNotice {
    pub fn new(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            task_id,
            reason: reason.into(),
        }
    }
}

/// Everything that travels over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(TaskRequest),
    Result(TaskResult),
    Heartbeat(Heartbeat),
    Cancel(CancelNotice),
}

impl Envelope {
    pub fn message_id(&self) -> MessageId {
        match self {
            Envelope::Request(r) => r.message_id,
            Envelope::Result(r) => r.message_id,
            Envelope::Heartbeat(h) => h.message_id,
            Envelope::Cancel(c) => c.message_id,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Envelope::Request(r) => Some(r.task_id),
            Envelope::Result(r) => Some(r.task_id),
            Envelope::Cancel(c) => Some(c.task_id),
            Envelope::Heartbeat(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Result(_) => "result",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::Cancel(_) => "cancel",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}
