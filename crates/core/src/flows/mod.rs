pub mod engine;
pub mod states;

pub use engine::{requires_approval, FlowDefinition, FlowEngine, FlowTransitionError, HitlApprovalFlow};
pub use states::{FlowContext, FlowEvent, FlowType, GraphNode, TransitionOutcome};
