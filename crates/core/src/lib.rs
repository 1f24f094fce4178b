pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use chrono;

pub use domain::agent::{JudgeResponse, SubAgent, SubAgentChoice};
pub use domain::checkpoint::{Checkpoint, Interrupt, Resume};
pub use domain::message::{ChatMessage, ConversationState, ToolCall};
pub use domain::models::{
    AgentResponse, ApprovalDecision, Link, MessageParticipants, OperationType, Participant,
    ResponseModel,
};
pub use domain::queue::{PendingEvaluation, QueueStatus};
pub use domain::thread::ThreadMessage;
pub use errors::{ApplicationError, DomainError, InterfaceError};
