//! Parsed documents and candidate entity extraction.
//!
//! The text format is deliberately small: blocks are separated by blank
//! lines, and a block may start with a `[tag key=value ...]` prefix that
//! sets its tag and attributes. A block starting with `# ` is a heading.

mod output;

pub use output::{OutputDocument, OutputSummary};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::util::truncate_chars;

/// `[tag attr=value attr="quoted value"]` at the start of a block.
static BLOCK_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[([A-Za-z][\w-]*)((?:\s+[\w-]+=(?:"[^"]*"|[^\s\]]+))*)\s*\]\s*"#)
        .expect("block prefix regex")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w-]+)=(?:"([^"]*)"|([^\s\]]+))"#).expect("attribute regex")
});

/// `**bold**` and `` `code` `` spans mark candidate terms inline.
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*\n]{2,80})\*\*|`([^`\n]{2,80})`").expect("emphasis regex"));

pub const DEFAULT_TAG: &str = "p";
pub const HEADING_TAG: &str = "heading";
const TERM_TAGS: [&str; 2] = ["term", "definition"];
const CONTEXT_CHARS: usize = 400;

/// Where a node sits in the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// 0-based block index.
    pub index: usize,
    /// 1-based line the block starts on.
    pub line: usize,
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {} (line {})", self.index + 1, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub node_ref: NodeRef,
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub nodes: Vec<DocumentNode>,
}

/// An entity worth researching plus the text it appeared in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,
    pub context: String,
    pub node_ref: NodeRef,
}

fn parse_block(index: usize, line: usize, block: &str) -> DocumentNode {
    let mut tag = DEFAULT_TAG.to_string();
    let mut attributes = BTreeMap::new();
    let mut body = block;

    if let Some(caps) = BLOCK_PREFIX.captures(block) {
        tag = caps[1].to_lowercase();
        if let Some(attrs) = caps.get(2) {
            for attr in ATTRIBUTE.captures_iter(attrs.as_str()) {
                let value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                attributes.insert(attr[1].to_lowercase(), value);
            }
        }
        body = &block[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
    } else if let Some(heading) = block.strip_prefix("# ") {
        tag = HEADING_TAG.to_string();
        body = heading;
    }

    DocumentNode {
        node_ref: NodeRef { index, line },
        tag,
        attributes,
        content: body.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Parse raw text into nodes. A document with no content is invalid.
pub fn parse_document(doc_id: &str, raw: &str) -> Result<ParsedDocument> {
    let mut nodes = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let mut block_line = 0;

    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            if !block.is_empty() {
                nodes.push(parse_block(nodes.len(), block_line, &block.join("\n")));
                block.clear();
            }
            continue;
        }
        if block.is_empty() {
            block_line = lineno + 1;
        }
        block.push(line.trim_end());
    }
    if !block.is_empty() {
        nodes.push(parse_block(nodes.len(), block_line, &block.join("\n")));
    }

    nodes.retain(|n| !n.content.is_empty() || !n.attributes.is_empty());
    if nodes.is_empty() {
        return Err(Error::Validation(format!("document {doc_id} has no content")));
    }
    // Indices stay contiguous after dropping empty blocks.
    for (index, node) in nodes.iter_mut().enumerate() {
        node.node_ref.index = index;
    }

    let title = nodes
        .iter()
        .find(|n| n.tag == HEADING_TAG)
        .map(|n| n.content.clone());

    Ok(ParsedDocument {
        doc_id: doc_id.to_string(),
        title,
        nodes,
    })
}

fn context_of(content: &str) -> String {
    truncate_chars(content, CONTEXT_CHARS).to_string()
}

/// Term of a `[term]` block: the `name` attribute, else the text before
/// the first `:` or ` - `.
fn term_name(node: &DocumentNode) -> Option<String> {
    if let Some(name) = node.attributes.get("name") {
        return Some(name.trim().to_string());
    }
    let head = node
        .content
        .split_once(':')
        .or_else(|| node.content.split_once(" - "))
        .map(|(head, _)| head)?;
    let head = head.trim();
    (!head.is_empty() && head.split_whitespace().count() <= 6).then(|| head.to_string())
}

impl ParsedDocument {
    /// Candidate entities in document order. Duplicates are kept; the
    /// orchestrator dedups by name and context.
    pub fn candidates(&self) -> Vec<CandidateEntity> {
        let mut out = Vec::new();
        for node in &self.nodes {
            if node.tag == HEADING_TAG {
                continue;
            }
            let context = context_of(&node.content);
            if TERM_TAGS.contains(&node.tag.as_str()) {
                if let Some(name) = term_name(node) {
                    out.push(CandidateEntity {
                        name,
                        context: context.clone(),
                        node_ref: node.node_ref,
                    });
                }
            }
            for caps in EMPHASIS.captures_iter(&node.content) {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                out.push(CandidateEntity {
                    name,
                    context: context.clone(),
                    node_ref: node.node_ref,
                });
            }
        }
        out
    }

    pub fn node(&self, index: usize) -> Option<&DocumentNode> {
        self.nodes.get(index)
    }
}
