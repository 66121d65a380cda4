//! Collaborator boundaries: text generation, search and document storage.
//!
//! Every call returns `Result<_, ProviderError>`; the error converts into
//! [`crate::Error`] once, at the handler edge, and its [`ErrorKind`] decides
//! whether the runtime retries.

mod local;

pub use local::{CorpusSearch, ExtractiveGenerator, FsDocumentStore, InMemoryDocumentStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Unavailable(_)
            | ProviderError::Timeout(_)
            | ProviderError::RateLimited(_) => ErrorKind::Transient,
            ProviderError::InvalidResponse(_) | ProviderError::NotFound(_) => {
                ErrorKind::Permanent
            }
        }
    }
}

// ========== Text generation ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Either a bare prompt or a chat transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    /// Flatten to plain text, one message per line.
    pub fn as_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Messages(messages) => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl Generation {
    pub fn stop(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
        }
    }

    /// Empty or filtered output. Callers treat it as low confidence, not an error.
    pub fn is_empty(&self) -> bool {
        self.finish_reason == FinishReason::ContentFilter || self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError>;
}

// ========== Search ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError>;
}

// ========== Document store ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub prefix: Option<String>,
    pub extension: Option<String>,
}

impl DocumentFilter {
    pub fn matches(&self, doc_id: &str) -> bool {
        let prefix_ok = self
            .prefix
            .as_deref()
            .map(|p| doc_id.starts_with(p))
            .unwrap_or(true);
        let extension_ok = self
            .extension
            .as_deref()
            .map(|ext| {
                doc_id
                    .rsplit_once('.')
                    .map(|(_, e)| e.eq_ignore_ascii_case(ext.trim_start_matches('.')))
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        prefix_ok && extension_ok
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, doc_id: &str) -> Result<String, ProviderError>;
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentMeta>, ProviderError>;
}
