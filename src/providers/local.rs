//! Offline collaborator implementations used by the binary and tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use super::{
    DocumentFilter, DocumentMeta, DocumentStore, FinishReason, Generation, GenerationOptions,
    Prompt, ProviderError, SearchHit, SearchProvider, TextGenerator, Usage,
};
use crate::error::Error;
use crate::util::{blocking, truncate_chars};

const SNIPPET_CHARS: usize = 240;

// ========== Document stores ==========

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<BTreeMap<String, String>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: impl Into<String>, content: impl Into<String>) {
        self.docs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(doc_id.into(), content.into());
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, doc_id: &str) -> Result<String, ProviderError> {
        self.docs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(doc_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(doc_id.to_string()))
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentMeta>, ProviderError> {
        let docs = self.docs.read().unwrap_or_else(|p| p.into_inner());
        Ok(docs
            .iter()
            .filter(|(id, _)| filter.matches(id))
            .map(|(id, content)| DocumentMeta {
                doc_id: id.clone(),
                size_bytes: content.len() as u64,
            })
            .collect())
    }
}

/// Documents are files under a root directory; the doc id is the relative path.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, doc_id: &str) -> Result<PathBuf, ProviderError> {
        let relative = Path::new(doc_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if doc_id.is_empty() || escapes {
            return Err(ProviderError::NotFound(doc_id.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_to_provider(doc_id: &str, err: Error) -> ProviderError {
    match err {
        Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            ProviderError::NotFound(doc_id.to_string())
        }
        other => ProviderError::Unavailable(other.to_string()),
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<DocumentMeta>) -> crate::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(DocumentMeta {
                doc_id: relative.to_string_lossy().replace('\\', "/"),
                size_bytes: meta.len(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get_document(&self, doc_id: &str) -> Result<String, ProviderError> {
        let path = self.resolve(doc_id)?;
        blocking(move || Ok(std::fs::read_to_string(path)?))
            .await
            .map_err(|e| io_to_provider(doc_id, e))
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentMeta>, ProviderError> {
        let root = self.root.clone();
        let mut docs = blocking(move || {
            let mut out = Vec::new();
            walk(&root, &root, &mut out)?;
            Ok(out)
        })
        .await
        .map_err(|e| io_to_provider(&self.root.display().to_string(), e))?;
        docs.retain(|d| filter.matches(&d.doc_id));
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(docs)
    }
}

// ========== Search ==========

#[derive(Debug, Clone, PartialEq, Eq)]
struct Passage {
    doc_id: String,
    index: usize,
    text: String,
}

/// Keyword search over the paragraphs of a fixed corpus.
#[derive(Debug, Clone, Default)]
pub struct CorpusSearch {
    passages: Vec<Passage>,
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    format!("{}...", truncate_chars(text, SNIPPET_CHARS).trim_end())
}

impl CorpusSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every blank-line separated paragraph of `content`.
    pub fn add_document(&mut self, doc_id: &str, content: &str) {
        let paragraphs = content
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty());
        for (index, text) in paragraphs.enumerate() {
            self.passages.push(Passage {
                doc_id: doc_id.to_string(),
                index,
                text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            });
        }
    }

    /// Index every document the store lists.
    pub async fn from_store(store: &dyn DocumentStore) -> Result<Self, ProviderError> {
        let mut search = Self::new();
        for meta in store.list_documents(&DocumentFilter::default()).await? {
            let content = store.get_document(&meta.doc_id).await?;
            search.add_document(&meta.doc_id, &content);
        }
        Ok(search)
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

#[async_trait]
impl SearchProvider for CorpusSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let wanted = terms(query);
        if wanted.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, &Passage)> = self
            .passages
            .iter()
            .map(|p| {
                let have = terms(&p.text);
                (wanted.iter().filter(|t| have.contains(t)).count(), p)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable: ties keep corpus order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(max_results)
            .map(|(_, p)| SearchHit {
                title: format!("{} #{}", p.doc_id, p.index + 1),
                snippet: snippet(&p.text),
                url: Some(format!("corpus://{}#{}", p.doc_id, p.index + 1)),
            })
            .collect())
    }
}

// ========== Generation ==========

/// Answers a definition prompt with the first context sentence that
/// mentions the quoted subject. Returns empty text when none does.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveGenerator;

fn quoted_subject(text: &str) -> Option<&str> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    Some(&text[start..start + len]).filter(|s| !s.trim().is_empty())
}

/// Drop a leading `Label:` so "Context: X" yields "X".
fn strip_label(line: &str) -> &str {
    match line.split_once(": ") {
        Some((label, rest)) if !label.is_empty() && label.chars().all(char::is_alphabetic) => rest,
        _ => line,
    }
}

#[async_trait]
impl TextGenerator for ExtractiveGenerator {
    async fn generate(
        &self,
        prompt: &Prompt,
        _options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        let text = prompt.as_text();
        let prompt_tokens = text.split_whitespace().count() as u32;

        let answer = quoted_subject(&text).and_then(|subject| {
            let needle = subject.to_lowercase();
            text.lines()
                .skip(1)
                .map(strip_label)
                .flat_map(|line| line.split_inclusive(['.', '!', '?']))
                .map(|s| s.trim().trim_start_matches("- ").trim())
                .find(|s| s.to_lowercase().contains(&needle) && s.len() > needle.len())
                .map(str::to_string)
        });

        let text = answer.unwrap_or_default();
        Ok(Generation {
            usage: Usage {
                prompt_tokens,
                completion_tokens: text.split_whitespace().count() as u32,
            },
            finish_reason: FinishReason::Stop,
            text,
        })
    }
}
