use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-agents the evaluator can route a thread to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SubAgent {
    #[serde(rename = "ArchitectureAgent")]
    Architecture,
    #[serde(rename = "QAAgent")]
    Qa,
}

impl SubAgent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "ArchitectureAgent",
            Self::Qa => "QAAgent",
        }
    }
}

impl fmt::Display for SubAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubAgent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ArchitectureAgent" => Ok(Self::Architecture),
            "QAAgent" => Ok(Self::Qa),
            other => Err(format!("unknown sub-agent `{other}` (expected ArchitectureAgent|QAAgent)")),
        }
    }
}

/// Verdict of the relevance judge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JudgeResponse {
    /// Whether the assistant should answer the message.
    pub should_answer: bool,
    /// Short justification for the decision.
    pub reasoning: String,
}

/// Choice made by the router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubAgentChoice {
    /// Which sub-agent should handle the message.
    pub sub_agent_name: SubAgent,
    /// Why that sub-agent fits.
    pub sub_agent_reasoning: String,
}
