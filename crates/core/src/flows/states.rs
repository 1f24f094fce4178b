use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::message::{ChatMessage, ConversationState};
use crate::domain::models::ResponseModel;
use crate::flows::engine::requires_approval;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    HitlApproval,
}

/// Nodes of the infrastructure conversation graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNode {
    GetMemories,
    LlmCall,
    ToolHandler,
    NeedInfo,
    Approval,
}

impl GraphNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetMemories => "get_memories",
            Self::LlmCall => "llm_call",
            Self::ToolHandler => "tool_handler",
            Self::NeedInfo => "need_info",
            Self::Approval => "approval",
        }
    }

    /// Nodes that pause the run until a human answers.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::NeedInfo | Self::Approval)
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GraphNode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "get_memories" => Ok(Self::GetMemories),
            "llm_call" => Ok(Self::LlmCall),
            "tool_handler" => Ok(Self::ToolHandler),
            "need_info" => Ok(Self::NeedInfo),
            "approval" => Ok(Self::Approval),
            other => Err(format!("unknown graph node `{other}`")),
        }
    }
}

/// What the node that just ran reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    MemoriesLoaded,
    ModelResponded,
    ToolExecuted,
    InfoReceived,
    ApprovalResolved,
}

impl FlowEvent {
    pub fn for_node(node: GraphNode) -> Self {
        match node {
            GraphNode::GetMemories => Self::MemoriesLoaded,
            GraphNode::LlmCall => Self::ModelResponded,
            GraphNode::ToolHandler => Self::ToolExecuted,
            GraphNode::NeedInfo => Self::InfoReceived,
            GraphNode::Approval => Self::ApprovalResolved,
        }
    }
}

/// Routing facts derived from the conversation state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub last_message_is_human: bool,
    pub need_info: bool,
    pub has_tool_calls: bool,
    pub approval_required: bool,
    pub approved: Option<bool>,
}

impl FlowContext {
    pub fn from_state(state: &ConversationState) -> Self {
        let last = state.last_message();
        let response = match last {
            Some(ChatMessage::Ai { content, .. }) => ResponseModel::from_content(content),
            _ => None,
        };
        let has_tool_calls = last.map(|message| !message.tool_calls().is_empty()).unwrap_or(false);

        Self {
            last_message_is_human: last.map(ChatMessage::is_human).unwrap_or(false),
            need_info: response.as_ref().map(|parsed| parsed.need_info).unwrap_or(false),
            has_tool_calls,
            approval_required: requires_approval(response.as_ref(), has_tool_calls),
            approved: state.approved,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: GraphNode,
    /// `None` means the run reached END.
    pub to: Option<GraphNode>,
    pub event: FlowEvent,
}
