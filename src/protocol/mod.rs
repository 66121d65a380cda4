//! A2A task messaging protocol.
//!
//! Defines the envelopes exchanged between agents (`TaskRequest`,
//! `TaskResult`, `Heartbeat`, `CancelNotice`), the closed set of intents,
//! identifier newtypes and the task lifecycle state machine.

mod envelope;
mod ids;
mod intent;
mod lifecycle;

pub use envelope::{
    CancelNotice, Envelope, Heartbeat, TaskError, TaskRequest, TaskResult, TaskStatus,
};
pub use ids::{AgentId, MessageId, TaskId};
pub use intent::Intent;
pub use lifecycle::{StateHistoryEntry, TaskRegistry, TaskState};
