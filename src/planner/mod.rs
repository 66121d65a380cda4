//! Verification planning.
//!
//! Scores every content node of a parsed document with a [`RuleSet`],
//! drops nodes below `min_confidence`, and batches the rest into tasks of
//! at most `max_nodes_per_task`, highest score first. Ties keep document
//! order, so identical input always yields an identical plan.
//!
//! ```
//! use glossa::config::PlannerConfig;
//! use glossa::document::parse_document;
//! use glossa::planner::VerificationPlanner;
//!
//! let doc = parse_document("d", "[claim] Rust is fast.\n\nJust prose.").unwrap();
//! let plan = VerificationPlanner::new(&PlannerConfig::default()).plan(&doc);
//! assert_eq!(plan.tasks.len(), 1);
//! assert_eq!(plan.tasks[0].nodes[0].content, "Rust is fast.");
//! ```

mod rules;

pub use rules::{FamilyWeights, Rule, RuleFamily, RuleSet};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::PlannerConfig;
use crate::document::{DocumentNode, NodeRef, ParsedDocument, HEADING_TAG};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Verified,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationNode {
    pub node_ref: NodeRef,
    pub content: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub confidence_score: f64,
    /// Matched rule names, in rule order; verification appends to it.
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationTask {
    pub batch: usize,
    pub nodes: Vec<VerificationNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationPlan {
    pub doc_id: String,
    pub min_confidence: f64,
    /// Content nodes that were scored.
    pub considered: usize,
    pub tasks: Vec<VerificationTask>,
}

impl VerificationPlan {
    pub fn total_nodes(&self) -> usize {
        self.tasks.iter().map(|t| t.nodes.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct VerificationPlanner {
    rules: RuleSet,
    min_confidence: f64,
    max_nodes_per_task: usize,
}

impl VerificationPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            rules: RuleSet::standard(),
            min_confidence: config.min_confidence,
            max_nodes_per_task: config.max_nodes_per_task.max(1),
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn score(&self, node: &DocumentNode) -> VerificationNode {
        let (confidence_score, evidence) = self.rules.score(node);
        VerificationNode {
            node_ref: node.node_ref,
            content: node.content.clone(),
            attributes: node.attributes.clone(),
            confidence_score,
            evidence,
            status: NodeStatus::Pending,
        }
    }

    pub fn plan(&self, doc: &ParsedDocument) -> VerificationPlan {
        let scored: Vec<VerificationNode> = doc
            .nodes
            .iter()
            .filter(|n| n.tag != HEADING_TAG)
            .map(|n| self.score(n))
            .collect();
        let considered = scored.len();

        let mut selected: Vec<VerificationNode> = scored
            .into_iter()
            .filter(|n| n.confidence_score >= self.min_confidence)
            .collect();
        // Stable sort: equal scores keep document order.
        selected.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));

        let tasks: Vec<VerificationTask> = selected
            .chunks(self.max_nodes_per_task)
            .enumerate()
            .map(|(batch, nodes)| VerificationTask {
                batch,
                nodes: nodes.to_vec(),
            })
            .collect();

        debug!(
            doc_id = %doc.doc_id,
            considered,
            selected = selected.len(),
            batches = tasks.len(),
            "verification plan built"
        );

        VerificationPlan {
            doc_id: doc.doc_id.clone(),
            min_confidence: self.min_confidence,
            considered,
            tasks,
        }
    }
}
