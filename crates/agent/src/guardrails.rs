use tars_core::OperationType;

/// A tool call about to run, as seen by the tool handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolIntent<'a> {
    pub tool_name: &'a str,
    pub operation_type: Option<OperationType>,
    pub approved: Option<bool>,
}

impl ToolIntent<'_> {
    /// Unclassified calls count as mutating.
    pub fn is_mutating(&self) -> bool {
        self.operation_type.map_or(true, |operation| operation.is_mutating())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub allowed_tools: Vec<String>,
    pub mutations_require_approval: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { allowed_tools: vec!["call_aws".to_string()], mutations_require_approval: true }
    }
}

impl GuardrailPolicy {
    pub fn with_tools(allowed_tools: Vec<String>) -> Self {
        Self { allowed_tools, ..Self::default() }
    }

    pub fn evaluate(&self, intent: &ToolIntent<'_>) -> GuardrailDecision {
        if !self.allowed_tools.iter().any(|tool| tool == intent.tool_name) {
            return GuardrailDecision::Deny {
                reason_code: "tool_not_allowed",
                user_message: format!(
                    "Tool '{}' is not available. Allowed tools: {}.",
                    intent.tool_name,
                    self.allowed_tools.join(", ")
                ),
            };
        }
        if self.mutations_require_approval && intent.is_mutating() && intent.approved != Some(true)
        {
            return GuardrailDecision::Deny {
                reason_code: "approval_required",
                user_message: format!(
                    "Tool '{}' was not executed: create/update/delete operations require explicit human approval.",
                    intent.tool_name
                ),
            };
        }
        GuardrailDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use tars_core::OperationType;

    use super::{GuardrailDecision, GuardrailPolicy, ToolIntent};

    #[test]
    fn read_operation_runs_without_approval() {
        let decision = GuardrailPolicy::default().evaluate(&ToolIntent {
            tool_name: "call_aws",
            operation_type: Some(OperationType::Read),
            approved: None,
        });
        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn unapproved_mutation_is_denied() {
        let policy = GuardrailPolicy::default();
        for operation_type in [Some(OperationType::Delete), None] {
            let decision = policy.evaluate(&ToolIntent {
                tool_name: "call_aws",
                operation_type,
                approved: Some(false),
            });
            let reason = match decision {
                GuardrailDecision::Deny { reason_code, .. } => reason_code,
                GuardrailDecision::Allow => "",
            };
            assert_eq!(reason, "approval_required");
        }

        let approved = policy.evaluate(&ToolIntent {
            tool_name: "call_aws",
            operation_type: Some(OperationType::Create),
            approved: Some(true),
        });
        assert_eq!(approved, GuardrailDecision::Allow);
    }

    #[test]
    fn tool_outside_allowlist_is_denied() {
        let decision = GuardrailPolicy::default().evaluate(&ToolIntent {
            tool_name: "suggest_aws_commands",
            operation_type: Some(OperationType::Read),
            approved: Some(true),
        });
        assert!(matches!(decision, GuardrailDecision::Deny { reason_code: "tool_not_allowed", .. }));
    }
}
