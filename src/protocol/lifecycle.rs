//! Task lifecycle state machine.
//!
//! Applies uniformly to root and child tasks:
//!
//! Pending -> Dispatched -> Running -> {Completed | Failed | TimedOut}
//!
//! `Running -> Pending` exists only for the agent runtime's internal retry
//! loop; the orchestrator only ever observes terminal states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{TaskId, TaskStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut
        )
    }

    /// Check if `self -> target` is a legal transition.
    pub fn can_transition(&self, target: TaskState) -> bool {
        matches!(
            (self, target),
            (TaskState::Pending, TaskState::Dispatched)
                | (TaskState::Dispatched, TaskState::Running)
                | (TaskState::Running, TaskState::Pending)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::TimedOut)
                // A dispatched child can miss its deadline before anyone
                // reports it running.
                | (TaskState::Dispatched, TaskState::Failed)
                | (TaskState::Dispatched, TaskState::TimedOut)
                | (TaskState::Pending, TaskState::TimedOut)
        )
    }
}

impl From<TaskStatus> for TaskState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed | TaskStatus::CompletedWithErrors => TaskState::Completed,
            TaskStatus::Failed => TaskState::Failed,
            TaskStatus::TimedOut => TaskState::TimedOut,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Dispatched => write!(f, "dispatched"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A record of a state change with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: TaskState,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TrackedTask {
    parent: Option<TaskId>,
    history: Vec<StateHistoryEntry>,
}

impl TrackedTask {
    fn state(&self) -> TaskState {
        self.history
            .last()
            .map(|entry| entry.state)
            .unwrap_or_default()
    }
}

/// Lifecycle bookkeeping for the tasks a supervisor owns.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TrackedTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a root task in `Pending`.
    pub fn register_root(&mut self, task_id: TaskId) {
        self.insert(task_id, None);
    }

    /// Start tracking a child task. The parent must currently be `Running`.
    pub fn register_child(&mut self, task_id: TaskId, parent: TaskId) -> Result<()> {
        match self.state(&parent) {
            Some(TaskState::Running) => {
                self.insert(task_id, Some(parent));
                Ok(())
            }
            _ => Err(Error::ParentNotRunning { parent }),
        }
    }

    fn insert(&mut self, task_id: TaskId, parent: Option<TaskId>) {
        self.tasks.insert(
            task_id,
            TrackedTask {
                parent,
                history: vec![StateHistoryEntry {
                    state: TaskState::Pending,
                    entered_at: Utc::now(),
                }],
            },
        );
    }

    pub fn state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.tasks.get(task_id).map(TrackedTask::state)
    }

    pub fn parent(&self, task_id: &TaskId) -> Option<TaskId> {
        self.tasks.get(task_id).and_then(|t| t.parent)
    }

    pub fn history(&self, task_id: &TaskId) -> Option<&[StateHistoryEntry]> {
        self.tasks.get(task_id).map(|t| t.history.as_slice())
    }

    /// Move a task to `target`, rejecting illegal transitions.
    pub fn transition(&mut self, task_id: &TaskId, target: TaskState) -> Result<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        let current = task.state();
        if !current.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        task.history.push(StateHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    /// Non-terminal children of `parent`.
    pub fn outstanding_children(&self, parent: &TaskId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.parent.as_ref() == Some(parent) && !t.state().is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forget a finished root and all of its children.
    pub fn remove_tree(&mut self, root: &TaskId) {
        self.tasks
            .retain(|id, t| id != root && t.parent.as_ref() != Some(root));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
