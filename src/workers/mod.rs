//! Worker agents behind the single-worker pipeline stages and the
//! research fan-out.
//!
//! Each worker implements [`Agent`](crate::runtime::Agent) and is wrapped in
//! an [`AgentRuntime`](crate::runtime::AgentRuntime); the payload structs
//! below are the JSON shapes exchanged with the orchestrator.

mod document;
mod research;
mod verification;

pub use document::DocumentAgent;
pub use research::ResearchAgent;
pub use verification::VerificationAgent;

use serde::{Deserialize, Serialize};

use crate::aggregate::DefinitionObject;
use crate::document::{CandidateEntity, ParsedDocument};
use crate::protocol::AgentId;

pub const ORCHESTRATOR_AGENT: &str = "orchestrator";
pub const DOCUMENT_AGENT: &str = "document";
pub const RESEARCH_AGENT: &str = "research";
pub const VERIFICATION_AGENT: &str = "verification";

/// Agent ids the orchestrator routes each stage to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub document: AgentId,
    pub research: AgentId,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            document: AgentId::from(DOCUMENT_AGENT),
            research: AgentId::from(RESEARCH_AGENT),
        }
    }
}

/// `ParseDocument` and `RunWorkflow` payload. Inline `content` skips the
/// document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl DocumentRequest {
    pub fn stored(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: None,
        }
    }

    pub fn inline(doc_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: Some(content.into()),
        }
    }
}

/// `ExtractEntities` and `CreateVerificationPlan` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub document: ParsedDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    pub candidates: Vec<CandidateEntity>,
}

/// `ResearchEntity` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub entity: String,
    #[serde(default)]
    pub context: String,
}

/// `AssembleOutput` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub definitions: Vec<DefinitionObject>,
    #[serde(default)]
    pub affected_entities: Vec<String>,
}
