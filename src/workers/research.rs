//! Entity research: search for sources, then ask the generator for a
//! one-sentence definition grounded in them.
//!
//! An empty or filtered generation is not an error. The finding degrades to
//! the top snippet (or nothing) at the configured confidence floor. It
//! carries no verifying sources, only a citation of the snippet's hit.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ResearchRequest, RESEARCH_AGENT};
use crate::aggregate::{clamp_confidence, ResearchFinding, Source, SourceType};
use crate::config::AggregationConfig;
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Intent, TaskRequest};
use crate::providers::{GenerationOptions, Prompt, SearchHit, SearchProvider, TextGenerator};
use crate::runtime::{Agent, Outcome, TaskContext};

const DEFAULT_MAX_SOURCES: usize = 3;
const TOP_SOURCE_CONFIDENCE: f64 = 0.9;
const RANK_DECAY: f64 = 0.8;

/// Stable id for a hit: the same url (or title) always maps to the same source.
pub fn source_id(hit: &SearchHit) -> Uuid {
    let key = hit.url.as_deref().unwrap_or(&hit.title);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

fn rank_confidence(rank: usize) -> f64 {
    clamp_confidence(TOP_SOURCE_CONFIDENCE * RANK_DECAY.powi(rank as i32))
}

fn to_source(rank: usize, hit: &SearchHit) -> Source {
    let source_type = match hit.url.as_deref() {
        Some(url) if url.starts_with("corpus://") => SourceType::Corpus,
        _ => SourceType::Search,
    };
    let citation = match &hit.url {
        Some(url) => format!("[{}] {} <{}>", rank + 1, hit.title, url),
        None => format!("[{}] {}", rank + 1, hit.title),
    };
    Source {
        source_id: source_id(hit),
        source_type,
        title: hit.title.clone(),
        url: hit.url.clone(),
        confidence: rank_confidence(rank),
        retrieved_at: Utc::now(),
        citation,
    }
}

fn definition_prompt(entity: &str, context: &str, hits: &[SearchHit]) -> Prompt {
    let mut text = format!("Define \"{entity}\" in one sentence using only the material below.\n");
    if !context.is_empty() {
        let _ = writeln!(text, "Context: {context}");
    }
    for hit in hits {
        let _ = writeln!(text, "Source: {}", hit.snippet);
    }
    Prompt::Text(text)
}

pub struct ResearchAgent {
    id: AgentId,
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn TextGenerator>,
    options: GenerationOptions,
    max_sources: usize,
    confidence_floor: f64,
}

impl ResearchAgent {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn TextGenerator>,
        config: &AggregationConfig,
    ) -> Self {
        Self {
            id: AgentId::from(RESEARCH_AGENT),
            search,
            generator,
            options: GenerationOptions {
                max_tokens: Some(128),
                temperature: Some(0.0),
            },
            max_sources: DEFAULT_MAX_SOURCES,
            confidence_floor: clamp_confidence(config.degraded_confidence_floor),
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_sources(mut self, max_sources: usize) -> Self {
        self.max_sources = max_sources;
        self
    }

    pub async fn research(&self, entity: &str, context: &str) -> Result<ResearchFinding> {
        if entity.trim().is_empty() {
            return Err(Error::malformed("ResearchEntity payload: empty entity"));
        }

        let hits = self.search.search(entity, self.max_sources).await?;
        let sources: Vec<Source> = hits.iter().enumerate().map(|(i, h)| to_source(i, h)).collect();

        let generation = self
            .generator
            .generate(&definition_prompt(entity, context, &hits), &self.options)
            .await?;

        if generation.is_empty() {
            warn!(
                entity,
                finish_reason = ?generation.finish_reason,
                "empty generation, degrading to snippet"
            );
            let snippet = hits.first().filter(|h| !h.snippet.trim().is_empty());
            return Ok(ResearchFinding {
                entity: entity.to_string(),
                context: context.to_string(),
                definition_text: snippet.map(|h| h.snippet.clone()).unwrap_or_default(),
                confidence: self.confidence_floor,
                sources: Vec::new(),
                citations: snippet
                    .map(|h| Source {
                        confidence: self.confidence_floor,
                        ..to_source(0, h)
                    })
                    .into_iter()
                    .collect(),
            });
        }

        debug!(entity, sources = sources.len(), "entity researched");
        Ok(ResearchFinding {
            entity: entity.to_string(),
            context: context.to_string(),
            definition_text: generation.text.trim().to_string(),
            confidence: sources
                .first()
                .map(|s| s.confidence)
                .unwrap_or(self.confidence_floor),
            sources,
            citations: Vec::new(),
        })
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn handles(&self, intent: &Intent) -> bool {
        *intent == Intent::ResearchEntity
    }

    async fn handle(&self, _ctx: TaskContext, request: &TaskRequest) -> Result<Outcome> {
        let ResearchRequest { entity, context } = request.payload_as()?;
        let finding = self.research(&entity, &context).await?;
        Ok(serde_json::to_value(finding)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::{CorpusSearch, ExtractiveGenerator, FinishReason, Generation, ProviderError};

    struct Filtered;

    #[async_trait]
    impl TextGenerator for Filtered {
        async fn generate(
            &self,
            _prompt: &Prompt,
            _options: &GenerationOptions,
        ) -> std::result::Result<Generation, ProviderError> {
            let mut generation = Generation::stop("");
            generation.finish_reason = FinishReason::ContentFilter;
            Ok(generation)
        }
    }

    struct RateLimited;

    #[async_trait]
    impl SearchProvider for RateLimited {
        async fn search(
            &self,
            _query: &str,
            _max_results: usize,
        ) -> std::result::Result<Vec<SearchHit>, ProviderError> {
            Err(ProviderError::RateLimited("429".into()))
        }
    }

    fn corpus() -> Arc<CorpusSearch> {
        let mut search = CorpusSearch::new();
        search.add_document(
            "rust.md",
            "Tokio is an asynchronous runtime for Rust.\n\nSerde is a framework for serializing data.",
        );
        Arc::new(search)
    }

    fn agent(generator: Arc<dyn TextGenerator>) -> ResearchAgent {
        ResearchAgent::new(corpus(), generator, &AggregationConfig::default())
    }

    #[tokio::test]
    async fn test_finding_is_grounded_in_sources() {
        let finding = agent(Arc::new(ExtractiveGenerator))
            .research("Tokio", "Tokio drives our services.")
            .await
            .unwrap();
        assert_eq!(finding.sources.len(), 1);
        assert_eq!(finding.sources[0].source_type, SourceType::Corpus);
        assert_eq!(finding.sources[0].confidence, TOP_SOURCE_CONFIDENCE);
        assert_eq!(finding.confidence, TOP_SOURCE_CONFIDENCE);
        assert!(finding.definition_text.contains("Tokio"));
    }

    #[tokio::test]
    async fn test_source_ids_are_stable() {
        let agent = agent(Arc::new(ExtractiveGenerator));
        let a = agent.research("Serde", "").await.unwrap();
        let b = agent.research("Serde", "").await.unwrap();
        assert_eq!(a.sources[0].source_id, b.sources[0].source_id);
    }

    #[tokio::test]
    async fn test_filtered_generation_degrades_to_floor() {
        let finding = agent(Arc::new(Filtered)).research("Serde", "").await.unwrap();
        assert_eq!(finding.confidence, 0.1);
        assert!(finding.sources.is_empty());
        assert_eq!(finding.definition_text, "Serde is a framework for serializing data.");
        assert_eq!(finding.citations.len(), 1);
        assert_eq!(finding.citations[0].source_type, SourceType::Corpus);
        assert_eq!(finding.citations[0].confidence, 0.1);
    }

    #[tokio::test]
    async fn test_nothing_found_and_nothing_generated() {
        let finding = agent(Arc::new(ExtractiveGenerator))
            .research("Quasar", "")
            .await
            .unwrap();
        assert!(finding.definition_text.is_empty());
        assert!(finding.sources.is_empty());
        assert!(finding.citations.is_empty());
        assert_eq!(finding.confidence, 0.1);
    }

    #[tokio::test]
    async fn test_provider_errors_keep_their_kind() {
        let agent = ResearchAgent::new(
            Arc::new(RateLimited),
            Arc::new(ExtractiveGenerator),
            &AggregationConfig::default(),
        );
        let err = agent.research("Tokio", "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = agent.research("  ", "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_rank_confidence_decays() {
        assert!(rank_confidence(0) > rank_confidence(1));
        assert!(rank_confidence(10) > 0.0);
    }
}
