//! Enumerated task intents.
//!
//! Intents travel as plain strings on the wire. Every tag this system
//! understands is a variant; anything else decodes to [`Intent::Unknown`]
//! so the receiving runtime can answer with a permanent failure instead of
//! dropping an undecodable frame.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Intent {
    /// Root request: run the whole pipeline for one document.
    RunWorkflow,
    ParseDocument,
    ExtractEntities,
    /// Fan-out child: research a single candidate entity.
    ResearchEntity,
    AssembleOutput,
    CreateVerificationPlan,
    BatchVerifyNodes,
    /// A tag not known to this build.
    Unknown(String),
}

impl Intent {
    /// All intents this build can route, in pipeline order.
    pub const KNOWN: [Intent; 7] = [
        Intent::RunWorkflow,
        Intent::ParseDocument,
        Intent::ExtractEntities,
        Intent::ResearchEntity,
        Intent::AssembleOutput,
        Intent::CreateVerificationPlan,
        Intent::BatchVerifyNodes,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Intent::RunWorkflow => "RunWorkflow",
            Intent::ParseDocument => "ParseDocument",
            Intent::ExtractEntities => "ExtractEntities",
            Intent::ResearchEntity => "ResearchEntity",
            Intent::AssembleOutput => "AssembleOutput",
            Intent::CreateVerificationPlan => "CreateVerificationPlan",
            Intent::BatchVerifyNodes => "BatchVerifyNodes",
            Intent::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Intent::Unknown(_))
    }
}

impl From<String> for Intent {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "RunWorkflow" => Intent::RunWorkflow,
            "ParseDocument" => Intent::ParseDocument,
            "ExtractEntities" => Intent::ExtractEntities,
            "ResearchEntity" => Intent::ResearchEntity,
            "AssembleOutput" => Intent::AssembleOutput,
            "CreateVerificationPlan" => Intent::CreateVerificationPlan,
            "BatchVerifyNodes" => Intent::BatchVerifyNodes,
            _ => Intent::Unknown(tag),
        }
    }
}

impl From<Intent> for String {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
