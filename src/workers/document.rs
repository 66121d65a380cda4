//! Parsing, extraction and assembly.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{AssembleRequest, DocumentPayload, DocumentRequest, ExtractedEntities, DOCUMENT_AGENT};
use crate::document::{parse_document, OutputDocument};
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Intent, TaskRequest};
use crate::providers::DocumentStore;
use crate::runtime::{Agent, Outcome, TaskContext};

pub struct DocumentAgent {
    id: AgentId,
    store: Arc<dyn DocumentStore>,
}

impl DocumentAgent {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            id: AgentId::from(DOCUMENT_AGENT),
            store,
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    async fn parse(&self, request: &TaskRequest) -> Result<Outcome> {
        let DocumentRequest { doc_id, content } = request.payload_as()?;
        let raw = match content {
            Some(raw) => raw,
            None => self.store.get_document(&doc_id).await?,
        };
        let document = parse_document(&doc_id, &raw)?;
        debug!(doc_id = %doc_id, nodes = document.nodes.len(), "document parsed");
        Ok(serde_json::to_value(document)?.into())
    }

    fn extract(&self, request: &TaskRequest) -> Result<Outcome> {
        let DocumentPayload { document } = request.payload_as()?;
        let candidates = document.candidates();
        debug!(doc_id = %document.doc_id, candidates = candidates.len(), "entities extracted");
        Ok(serde_json::to_value(ExtractedEntities { candidates })?.into())
    }

    fn assemble(&self, request: &TaskRequest) -> Result<Outcome> {
        let AssembleRequest {
            doc_id,
            title,
            definitions,
            affected_entities,
        } = request.payload_as()?;
        let output = OutputDocument::assemble(doc_id, title, definitions, affected_entities);
        output.validate()?;
        Ok(serde_json::to_value(output)?.into())
    }
}

#[async_trait]
impl Agent for DocumentAgent {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn handles(&self, intent: &Intent) -> bool {
        matches!(
            intent,
            Intent::ParseDocument | Intent::ExtractEntities | Intent::AssembleOutput
        )
    }

    async fn handle(&self, _ctx: TaskContext, request: &TaskRequest) -> Result<Outcome> {
        match request.intent {
            Intent::ParseDocument => self.parse(request).await,
            Intent::ExtractEntities => self.extract(request),
            Intent::AssembleOutput => self.assemble(request),
            _ => Err(Error::UnknownIntent(request.intent.clone())),
        }
    }
}
