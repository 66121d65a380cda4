//! Research-worthiness rules.
//!
//! Three rule families score a node independently:
//! - **Keyword**: the node's tag names a semantic role (claim, statistic, ...)
//! - **Attribute**: a node attribute flags doubt (`confidence=low`, `status=draft`)
//! - **Pattern**: the content matches a regex (percentages, superlatives, ...)
//!
//! A family's score is the probabilistic union of its matched rule weights.
//! The combined score is the probabilistic union of the family scores, each
//! scaled by its family weight normalized against the largest one.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::document::DocumentNode;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    Keyword,
    Attribute,
    Pattern,
}

#[derive(Debug, Clone)]
enum Matcher {
    Tag(Vec<String>),
    Attribute { key: String, values: Vec<String> },
    /// `unless` suppresses the match, e.g. when a citation is present.
    Pattern { pattern: Regex, unless: Option<Regex> },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub family: RuleFamily,
    pub weight: f64,
    matcher: Matcher,
}

fn lowercase_all(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid rule pattern {pattern:?}: {e}")))
}

impl Rule {
    pub fn keyword(name: &str, tags: &[&str], weight: f64) -> Self {
        Self {
            name: name.to_string(),
            family: RuleFamily::Keyword,
            weight,
            matcher: Matcher::Tag(lowercase_all(tags)),
        }
    }

    pub fn attribute(name: &str, key: &str, values: &[&str], weight: f64) -> Self {
        Self {
            name: name.to_string(),
            family: RuleFamily::Attribute,
            weight,
            matcher: Matcher::Attribute {
                key: key.to_lowercase(),
                values: lowercase_all(values),
            },
        }
    }

    pub fn pattern(name: &str, pattern: &str, weight: f64) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            family: RuleFamily::Pattern,
            weight,
            matcher: Matcher::Pattern {
                pattern: compile(pattern)?,
                unless: None,
            },
        })
    }

    /// Only match when `unless` does not.
    pub fn unless(mut self, pattern: &str) -> Result<Self> {
        if let Matcher::Pattern { unless, .. } = &mut self.matcher {
            *unless = Some(compile(pattern)?);
        }
        Ok(self)
    }

    pub fn matches(&self, node: &DocumentNode) -> bool {
        match &self.matcher {
            Matcher::Tag(tags) => tags.iter().any(|t| t.eq_ignore_ascii_case(&node.tag)),
            Matcher::Attribute { key, values } => node
                .attributes
                .get(key)
                .map(|v| values.iter().any(|want| want.eq_ignore_ascii_case(v.trim())))
                .unwrap_or(false),
            Matcher::Pattern { pattern, unless } => {
                pattern.is_match(&node.content)
                    && !unless.as_ref().is_some_and(|u| u.is_match(&node.content))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyWeights {
    pub keyword: f64,
    pub attribute: f64,
    pub pattern: f64,
}

impl Default for FamilyWeights {
    fn default() -> Self {
        Self {
            keyword: 1.0,
            attribute: 0.8,
            pattern: 0.9,
        }
    }
}

impl FamilyWeights {
    fn get(&self, family: RuleFamily) -> f64 {
        match family {
            RuleFamily::Keyword => self.keyword,
            RuleFamily::Attribute => self.attribute,
            RuleFamily::Pattern => self.pattern,
        }
    }

    fn max(&self) -> f64 {
        self.keyword.max(self.attribute).max(self.pattern)
    }
}

/// Probabilistic union: 1 - prod(1 - w).
fn union(weights: impl IntoIterator<Item = f64>) -> f64 {
    1.0 - weights
        .into_iter()
        .map(|w| 1.0 - w.clamp(0.0, 1.0))
        .product::<f64>()
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    weights: FamilyWeights,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleSet {
    pub fn new(weights: FamilyWeights) -> Self {
        Self {
            rules: Vec::new(),
            weights,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The built-in rules.
    pub fn standard() -> Self {
        let builtin = || -> Result<Self> {
            Ok(Self::new(FamilyWeights::default())
                .with_rule(Rule::keyword("claim-tag", &["claim", "assertion"], 0.6))
                .with_rule(Rule::keyword("statistic-tag", &["statistic", "figure"], 0.7))
                .with_rule(Rule::keyword("definition-tag", &["definition", "term"], 0.4))
                .with_rule(Rule::attribute("confidence-low", "confidence", &["low"], 0.7))
                .with_rule(Rule::attribute("confidence-medium", "confidence", &["medium"], 0.4))
                .with_rule(Rule::attribute("status-draft", "status", &["draft", "unverified"], 0.5))
                .with_rule(Rule::attribute("verified-false", "verified", &["false", "no"], 0.6))
                .with_rule(Rule::pattern("percentage", r"\b\d+(?:\.\d+)?\s?%", 0.6)?)
                .with_rule(Rule::pattern(
                    "superlative",
                    r"(?i)\b(?:best|worst|fastest|slowest|largest|smallest|most\s+\w+|least\s+\w+|only)\b",
                    0.4,
                )?)
                .with_rule(
                    Rule::pattern(
                        "unattributed-statistic",
                        r"(?i)\b\d[\d,.]*\s*(?:million|billion|thousand|percent|times|x)\b",
                        0.5,
                    )?
                    .unless(r"(?i)\[\d+\]|according to|\bsource:|\(\w+,? \d{4}\)")?,
                )
                .with_rule(Rule::pattern("year-claim", r"\b(?:1[89]|20)\d{2}\b", 0.3)?))
        };
        match builtin() {
            Ok(rules) => rules,
            Err(err) => unreachable!("built-in rule patterns compile: {err}"),
        }
    }

    /// Combined score in [0, 1] plus the names of matched rules, in rule order.
    pub fn score(&self, node: &DocumentNode) -> (f64, Vec<String>) {
        let matched: Vec<&Rule> = self.rules.iter().filter(|r| r.matches(node)).collect();
        let evidence = matched.iter().map(|r| r.name.clone()).collect();

        let max = self.weights.max();
        if max <= 0.0 {
            return (0.0, evidence);
        }
        let combined = union(
            [RuleFamily::Keyword, RuleFamily::Attribute, RuleFamily::Pattern]
                .into_iter()
                .map(|family| {
                    let family_score =
                        union(matched.iter().filter(|r| r.family == family).map(|r| r.weight));
                    (self.weights.get(family) / max) * family_score
                }),
        );
        (combined.clamp(0.0, 1.0), evidence)
    }
}
