use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of cloud operation a proposed tool call performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Read,
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Structured reply of the infrastructure model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseModel {
    /// Message for the user, or the question to ask when information is missing.
    pub content: String,
    /// True when the user must supply more information before continuing.
    #[serde(default)]
    pub need_info: bool,
    /// Name of the tool to call, if any.
    #[serde(default)]
    pub tool_to_call: Option<String>,
    /// Arguments for the tool call.
    #[serde(default)]
    pub tool_args: Option<Value>,
    /// Kind of operation the tool call performs.
    #[serde(default, deserialize_with = "lenient_operation_type")]
    #[schemars(with = "Option<OperationType>")]
    pub operation_type: Option<OperationType>,
    /// True when the tool call needs explicit human approval.
    #[serde(default)]
    pub hitl_tool_approval: bool,
    /// Why approval is needed.
    #[serde(default)]
    pub hitl_tool_approval_reason: Option<String>,
}

/// Unknown labels become `None`, which the approval gate treats as mutating.
fn lenient_operation_type<'de, D>(deserializer: D) -> Result<Option<OperationType>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

impl ResponseModel {
    pub fn from_content(content: &str) -> Option<Self> {
        parse_json_object(content).ok()
    }
}

/// A human decision on a proposed tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalDecision {
    /// Whether the user authorized the call.
    pub approved: bool,
    /// The user's reason, when given.
    #[serde(default)]
    pub reason: Option<String>,
    /// Replacement arguments when the user changed the proposal.
    #[serde(default)]
    pub edited_args: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self { approved: true, reason: None, edited_args: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { approved: false, reason: Some(reason.into()), edited_args: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Who wrote a message and who it is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MessageParticipants {
    /// Step-by-step reasoning used to identify the participants.
    pub cot: String,
    pub sender: Participant,
    #[serde(default)]
    pub receivers: Vec<Participant>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Final structured answer of the research agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentResponse {
    pub main_topic: String,
    pub intent: String,
    pub analysis: String,
    #[serde(default)]
    pub processing_steps: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub documentation: Vec<Link>,
    pub summary: String,
}

pub fn schema_json<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

/// The `properties` object of a type's schema, used in strict-output prompts.
pub fn schema_properties<T: JsonSchema>() -> Value {
    schema_json::<T>().get("properties").cloned().unwrap_or_else(|| Value::Object(Default::default()))
}

/// Parses a JSON object out of model output.
///
/// Handles replies that continue an assistant `{` prefill, replies wrapped in
/// prose or code fences, and trailing text after the closing brace.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let trimmed = raw.trim();
    let end = trimmed.rfind('}').map(|index| index + 1).unwrap_or(trimmed.len());
    let head = &trimmed[..end];

    let mut candidates = Vec::with_capacity(3);
    if head.starts_with('{') {
        candidates.push(head.to_string());
    } else {
        candidates.push(format!("{{{head}"));
        if let Some(start) = head.find('{') {
            candidates.push(head[start..].to_string());
        }
    }

    let mut last_error = None;
    for candidate in candidates {
        match serde_json::from_str::<T>(&candidate) {
            Ok(parsed) => return Ok(parsed),
            Err(error) => last_error = Some(error),
        }
    }

    match last_error {
        Some(error) => Err(error),
        None => serde_json::from_str::<T>(trimmed),
    }
}
