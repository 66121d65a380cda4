//! The assembled output document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

use crate::aggregate::{normalize_entity, DefinitionObject, DefinitionStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub total: usize,
    pub verified: usize,
    pub degraded: usize,
    pub unverified: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDocument {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub definitions: Vec<DefinitionObject>,
    #[serde(default)]
    pub affected_entities: Vec<String>,
    pub summary: OutputSummary,
}

impl OutputDocument {
    pub fn assemble(
        doc_id: impl Into<String>,
        title: Option<String>,
        definitions: Vec<DefinitionObject>,
        affected_entities: Vec<String>,
    ) -> Self {
        let mut summary = OutputSummary {
            total: definitions.len(),
            ..Default::default()
        };
        for def in &definitions {
            match def.status {
                DefinitionStatus::Verified => summary.verified += 1,
                DefinitionStatus::Degraded => summary.degraded += 1,
                DefinitionStatus::Unverified => summary.unverified += 1,
            }
        }
        Self {
            doc_id: doc_id.into(),
            title,
            generated_at: Utc::now(),
            definitions,
            affected_entities,
            summary,
        }
    }

    /// Structural checks on the assembled output.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for def in &self.definitions {
            let key = normalize_entity(&def.entity);
            if key.is_empty() {
                return Err(Error::Validation("definition with empty entity".into()));
            }
            if !seen.insert(key) {
                return Err(Error::Validation(format!("duplicate entity {:?}", def.entity)));
            }
            if !(0.0..=1.0).contains(&def.confidence) {
                return Err(Error::Validation(format!(
                    "confidence {} of {:?} outside [0, 1]",
                    def.confidence, def.entity
                )));
            }
            let mut ids = HashSet::new();
            if !def.sources.iter().all(|s| ids.insert(s.source_id)) {
                return Err(Error::Validation(format!("duplicate source for {:?}", def.entity)));
            }
            match def.status {
                DefinitionStatus::Verified if def.sources.is_empty() => {
                    return Err(Error::Validation(format!(
                        "{:?} is verified without sources",
                        def.entity
                    )));
                }
                DefinitionStatus::Degraded if def.definition_text.trim().is_empty() => {
                    return Err(Error::Validation(format!(
                        "{:?} is degraded without a definition",
                        def.entity
                    )));
                }
                DefinitionStatus::Unverified if def.confidence > 0.0 => {
                    return Err(Error::Validation(format!(
                        "{:?} is unverified with nonzero confidence",
                        def.entity
                    )));
                }
                _ => {}
            }
        }
        if self.summary.total != self.definitions.len() {
            return Err(Error::Validation("summary does not match definitions".into()));
        }
        Ok(())
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let title = self.title.as_deref().unwrap_or(&self.doc_id);
        let _ = writeln!(out, "# Glossary: {title}\n");
        let _ = writeln!(
            out,
            "{} entities: {} verified, {} degraded, {} unverified.\n",
            self.summary.total, self.summary.verified, self.summary.degraded, self.summary.unverified
        );

        for def in &self.definitions {
            let _ = writeln!(out, "## {}\n", def.entity);
            let marker = match def.status {
                DefinitionStatus::Verified => "verified",
                DefinitionStatus::Degraded => "degraded",
                DefinitionStatus::Unverified => "unverified",
            };
            let _ = writeln!(out, "*{marker}, confidence {:.2}*\n", def.confidence);
            if def.definition_text.is_empty() {
                let _ = writeln!(out, "_No definition available._\n");
            } else {
                let _ = writeln!(out, "{}\n", def.definition_text);
            }
            for source in &def.sources {
                match &source.url {
                    Some(url) => {
                        let _ = writeln!(out, "- [{}]({}) ({:.2})", source.title, url, source.confidence);
                    }
                    None => {
                        let _ = writeln!(out, "- {} ({:.2})", source.title, source.confidence);
                    }
                }
            }
            if !def.sources.is_empty() {
                out.push('\n');
            }
        }

        if !self.affected_entities.is_empty() {
            let _ = writeln!(out, "---\n\nIncomplete research: {}", self.affected_entities.join(", "));
        }
        out
    }
}
