//! Agent runtime for the TARS Slack assistant.
//!
//! - `evaluator` decides whether a thread message gets an answer and routes it
//!   to a sub-agent.
//! - `graph` runs the infrastructure conversation with approval and
//!   need-info interrupts, checkpointing after every node.
//! - `architecture` resumes or starts that graph for a Slack reply.
//! - `qa` is the documentation research agent.
//!
//! Model access goes through [`llm::LlmClient`]; tools implement [`tools::Tool`].

pub mod architecture;
pub mod conversation;
pub mod evaluator;
pub mod graph;
pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod qa;
pub mod runtime;
pub mod tools;
pub mod web_search;

pub use architecture::{ArchitectureAgent, ArchitectureError, ArchitectureReply};
pub use evaluator::{EvaluationError, EvaluationOutcome, Evaluator};
pub use graph::{ConversationGraph, GraphError, GraphOutcome};
pub use llm::{build_llm_client, LlmClient, LlmError};
pub use qa::{QaAgent, QaError, QaReply};
pub use runtime::{AgentDispatcher, AgentRuntime, DispatchError, RuntimeDeps};
pub use tools::{Tool, ToolRegistry, ToolSpec};
