//! glossa: multi-agent document glossary and verification pipeline.
//!
//! Agents exchange typed envelopes over a topic broker. The orchestrator
//! turns one `RunWorkflow` request into parse, extract, a bounded research
//! fan-out and assembly, and returns a glossary with per-entity
//! verification status.

pub mod aggregate;
pub mod broker;
pub mod config;
pub mod document;
pub mod error;
pub mod log;
pub mod orchestrator;
pub mod planner;
pub mod protocol;
pub mod providers;
pub mod runtime;
pub mod util;
pub mod workers;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, WorkflowClient, WorkflowReport};
