//! Result aggregation for one fan-out stage.
//!
//! The aggregator is the per-parent map from child `task_id` to terminal
//! outcome. It accepts the first terminal outcome per child, counts down
//! the outstanding children, and merges the findings into one
//! [`DefinitionObject`] per entity. An entity is never dropped: research
//! that produced nothing still yields a degraded or unverified definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AggregationConfig, ConflictPolicy};
use crate::error::ErrorKind;
use crate::protocol::{TaskError, TaskId, TaskResult, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Search,
    Corpus,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: Uuid,
    pub source_type: SourceType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub confidence: f64,
    pub retrieved_at: DateTime<Utc>,
    pub citation: String,
}

/// What a `ResearchEntity` child returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchFinding {
    pub entity: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub definition_text: String,
    /// The worker's own confidence in `definition_text`.
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Where a fallback `definition_text` was lifted from. Cited in the
    /// output but never counted as verification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Source>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Backed by at least one source.
    Verified,
    /// Research completed but found no source; text is generated or a snippet.
    Degraded,
    /// No child produced any text: all failed, timed out or came back empty.
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionObject {
    pub entity: String,
    pub definition_text: String,
    pub confidence: f64,
    pub status: DefinitionStatus,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub definitions: Vec<DefinitionObject>,
    /// Entities with at least one failed or timed-out child.
    pub affected_entities: Vec<String>,
}

impl AggregateReport {
    pub fn has_errors(&self) -> bool {
        !self.affected_entities.is_empty()
    }
}

/// Terminal outcome of one child as seen by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Completed(ResearchFinding),
    Failed(TaskError),
    TimedOut,
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Case-, whitespace- and edge-punctuation-insensitive entity key.
pub fn normalize_entity(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[derive(Debug)]
pub struct Aggregator {
    config: AggregationConfig,
    expected: HashMap<TaskId, String>,
    order: Vec<TaskId>,
    outcomes: HashMap<TaskId, ChildOutcome>,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            expected: HashMap::new(),
            order: Vec::new(),
            outcomes: HashMap::new(),
        }
    }

    /// Register a child before it is dispatched.
    pub fn expect(&mut self, task_id: TaskId, entity: impl Into<String>) {
        if self.expected.insert(task_id, entity.into()).is_none() {
            self.order.push(task_id);
        }
    }

    fn record(&mut self, task_id: TaskId, outcome: ChildOutcome) -> bool {
        if !self.expected.contains_key(&task_id) {
            debug!(task_id = %task_id, "result for unknown child ignored");
            return false;
        }
        if self.outcomes.contains_key(&task_id) {
            debug!(task_id = %task_id, "late terminal result ignored");
            return false;
        }
        self.outcomes.insert(task_id, outcome);
        true
    }

    /// Accept a child's terminal result. Only the first per child counts.
    pub fn accept(&mut self, result: TaskResult) -> bool {
        let outcome = match result.status {
            TaskStatus::Completed | TaskStatus::CompletedWithErrors => {
                let payload = result.result.clone().unwrap_or_default();
                match serde_json::from_value::<ResearchFinding>(payload) {
                    Ok(finding) => ChildOutcome::Completed(finding),
                    Err(err) => {
                        warn!(task_id = %result.task_id, error = %err, "undecodable research finding");
                        ChildOutcome::Failed(TaskError::new(
                            ErrorKind::Permanent,
                            format!("malformed finding: {err}"),
                        ))
                    }
                }
            }
            TaskStatus::Failed => ChildOutcome::Failed(result.error.clone().unwrap_or_else(|| {
                TaskError::new(ErrorKind::Permanent, "failed without error detail")
            })),
            TaskStatus::TimedOut => ChildOutcome::TimedOut,
        };
        self.record(result.task_id, outcome)
    }

    pub fn mark_failed(&mut self, task_id: TaskId, error: TaskError) -> bool {
        self.record(task_id, ChildOutcome::Failed(error))
    }

    /// Close the stage: every child without an outcome is timed out.
    pub fn time_out_remaining(&mut self) -> Vec<TaskId> {
        let remaining: Vec<TaskId> = self
            .order
            .iter()
            .filter(|id| !self.outcomes.contains_key(id))
            .copied()
            .collect();
        for task_id in &remaining {
            self.outcomes.insert(*task_id, ChildOutcome::TimedOut);
        }
        remaining
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    /// Children still owed a terminal outcome.
    pub fn pending(&self) -> usize {
        self.expected.len() - self.outcomes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }

    pub fn outcome(&self, task_id: &TaskId) -> Option<&ChildOutcome> {
        self.outcomes.get(task_id)
    }

    /// Merge everything into per-entity definitions, in registration order.
    pub fn finish(self) -> AggregateReport {
        let mut groups: Vec<(String, Vec<Option<&ChildOutcome>>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for task_id in &self.order {
            let name = &self.expected[task_id];
            let key = normalize_entity(name);
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((name.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(self.outcomes.get(task_id));
        }

        let mut definitions = Vec::with_capacity(groups.len());
        let mut affected_entities = Vec::new();
        for (entity, outcomes) in groups {
            let findings: Vec<&ResearchFinding> = outcomes
                .iter()
                .filter_map(|o| match o {
                    Some(ChildOutcome::Completed(finding)) => Some(finding),
                    _ => None,
                })
                .collect();
            if findings.len() < outcomes.len() {
                affected_entities.push(entity.clone());
            }
            definitions.push(merge(&self.config, entity, &findings));
        }

        AggregateReport {
            definitions,
            affected_entities,
        }
    }
}

fn best_source_confidence(finding: &ResearchFinding) -> f64 {
    finding
        .sources
        .iter()
        .map(|s| clamp_confidence(s.confidence))
        .fold(0.0, f64::max)
}

fn unverified(entity: String) -> DefinitionObject {
    DefinitionObject {
        entity,
        definition_text: String::new(),
        confidence: 0.0,
        status: DefinitionStatus::Unverified,
        sources: Vec::new(),
    }
}

fn merge(config: &AggregationConfig, entity: String, findings: &[&ResearchFinding]) -> DefinitionObject {
    if findings.is_empty() {
        return unverified(entity);
    }

    let mut by_id: HashMap<Uuid, Source> = HashMap::new();
    for source in findings.iter().flat_map(|f| f.sources.iter()) {
        let mut source = source.clone();
        source.confidence = clamp_confidence(source.confidence);
        match by_id.get(&source.source_id) {
            Some(kept) if kept.confidence >= source.confidence => {}
            _ => {
                by_id.insert(source.source_id, source);
            }
        }
    }
    let mut sources: Vec<Source> = by_id.into_values().collect();
    sources.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.title.cmp(&b.title))
    });

    let with_text: Vec<&&ResearchFinding> = findings
        .iter()
        .filter(|f| !f.definition_text.trim().is_empty())
        .collect();

    if sources.is_empty() {
        let Some(fallback) = with_text.first() else {
            debug!(entity = %entity, "research produced no text");
            return unverified(entity);
        };
        let floor = clamp_confidence(config.degraded_confidence_floor);
        let own = findings
            .iter()
            .map(|f| clamp_confidence(f.confidence))
            .fold(0.0, f64::max);
        let mut seen = HashSet::new();
        let citations = fallback
            .citations
            .iter()
            .filter(|c| seen.insert(c.source_id))
            .map(|c| Source {
                confidence: clamp_confidence(c.confidence).min(floor),
                ..c.clone()
            })
            .collect();
        return DefinitionObject {
            entity,
            definition_text: fallback.definition_text.clone(),
            confidence: own.min(floor),
            status: DefinitionStatus::Degraded,
            sources: citations,
        };
    }

    // The policy picks the text only; confidence stays the best source.
    let chosen = match config.conflict_policy {
        ConflictPolicy::HighestConfidence => with_text.iter().copied().reduce(|best, f| {
            if best_source_confidence(f) > best_source_confidence(best) {
                f
            } else {
                best
            }
        }),
        ConflictPolicy::MostSources => with_text.iter().copied().reduce(|best, f| {
            let more = f.sources.len() > best.sources.len();
            let tie_but_stronger = f.sources.len() == best.sources.len()
                && best_source_confidence(f) > best_source_confidence(best);
            if more || tie_but_stronger {
                f
            } else {
                best
            }
        }),
    };

    DefinitionObject {
        entity,
        definition_text: chosen.map(|f| f.definition_text.clone()).unwrap_or_default(),
        confidence: sources[0].confidence,
        status: DefinitionStatus::Verified,
        sources,
    }
}
