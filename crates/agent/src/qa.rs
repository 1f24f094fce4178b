//! Research agent: answers technical questions with documentation tools and
//! web search, then posts a summary with the steps it took.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use tars_core::domain::log::{ConversationLogEntry, SessionMessage};
use tars_core::domain::models::{parse_json_object, schema_properties};
use tars_core::domain::requests::{QaRequest, SendRequest};
use tars_core::{AgentResponse, ChatMessage, MessageParticipants, Participant, SubAgent};
use tars_db::repositories::{ConversationLogRepository, RepositoryError, SessionHistoryRepository};

use crate::conversation::{qa_session_id, slack_ts_local, today};
use crate::llm::{complete_structured, LlmClient, LlmError, LlmRequest};
use crate::prompts::{PromptError, PromptLibrary};
use crate::runtime::AgentDispatcher;
use crate::tools::{render_output, ToolRegistry};

/// Tools the research agent may use from its MCP servers.
pub const QA_TOOL_ALLOWLIST: &[&str] =
    &["read_documentation", "search_documentation", "recommend", "get_serverless_templates", "fetch"];
const STEPS_HEADING: &str = "Steps I took to reach this answer:";
const PARTICIPANTS_MAX_TOKENS: u32 = 750;

#[derive(Debug, Error)]
pub enum QaError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("failed to load employee directory `{path}`: {detail}")]
    Directory { path: String, detail: String },
    #[error("research agent hit its recursion limit of {0} steps")]
    RecursionLimit(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Employee {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub channels_list: Vec<String>,
}

/// Who sits in which channel, read from a JSON list of employees.
#[derive(Clone, Debug, Default)]
pub struct EmployeeDirectory {
    employees: Vec<Employee>,
}

impl EmployeeDirectory {
    pub fn new(employees: Vec<Employee>) -> Self {
        Self { employees }
    }

    pub fn load(path: &Path) -> Result<Self, QaError> {
        let error = |detail: String| QaError::Directory { path: path.display().to_string(), detail };
        let raw = std::fs::read_to_string(path).map_err(|source| error(source.to_string()))?;
        let employees = serde_json::from_str(&raw).map_err(|source| error(source.to_string()))?;
        Ok(Self { employees })
    }

    pub fn load_or_empty(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|load_error| {
            warn!(event_name = "qa.directory_unavailable", error = %load_error);
            Self::default()
        })
    }

    pub fn members_of(&self, channel: &str) -> Vec<Participant> {
        self.employees
            .iter()
            .filter(|employee| employee.channels_list.iter().any(|name| name == channel))
            .map(|employee| Participant { name: employee.name.clone(), role: employee.role.clone() })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct QaSettings {
    pub recursion_limit: u32,
    pub utc_offset_minutes: i32,
}

impl Default for QaSettings {
    fn default() -> Self {
        Self { recursion_limit: 50, utc_offset_minutes: 0 }
    }
}

/// Response body of the research endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QaReply {
    pub success: bool,
    pub processed_message: Value,
    pub response: String,
    pub processing_time: String,
}

/// Messages and tool traffic of one ReAct run.
struct ReactTrace {
    messages: Vec<ChatMessage>,
    response: AgentResponse,
}

pub struct QaAgent {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    tools: ToolRegistry,
    directory: EmployeeDirectory,
    sessions: Arc<dyn SessionHistoryRepository>,
    logs: Arc<dyn ConversationLogRepository>,
    dispatcher: Arc<dyn AgentDispatcher>,
    settings: QaSettings,
}

impl QaAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        tools: ToolRegistry,
        directory: EmployeeDirectory,
        sessions: Arc<dyn SessionHistoryRepository>,
        logs: Arc<dyn ConversationLogRepository>,
        dispatcher: Arc<dyn AgentDispatcher>,
        settings: QaSettings,
    ) -> Self {
        Self { llm, prompts, tools, directory, sessions, logs, dispatcher, settings }
    }

    pub async fn handle(&self, request: &QaRequest, correlation_id: &str) -> Result<QaReply, QaError> {
        let started = Instant::now();
        let offset = self.settings.utc_offset_minutes;
        info!(
            event_name = "qa.started",
            thread_id = %request.thread_ts,
            channel = %request.channel,
            correlation_id,
            tools = self.tools.len(),
        );

        let participants = self.identify_participants(request).await;
        let session_id = qa_session_id(request.reply_channel(), &request.thread_ts, offset);
        self.record_session(&session_id, "human", &request.message).await?;

        let trace = self.react(request, &participants).await?;
        let slack_response = format_slack_response(&trace.response);
        self.record_session(&session_id, "ai", &slack_response).await?;

        let entry = ConversationLogEntry {
            channel_name: request.channel.clone(),
            thread_ts: request.thread_ts.clone(),
            message_ts: request.ts.clone(),
            agent: SubAgent::Qa,
            thread_local_time: slack_ts_local(&request.thread_ts, offset, false)
                .unwrap_or_else(|| request.thread_ts.clone()),
            message_local_time: slack_ts_local(&request.ts, offset, true)
                .unwrap_or_else(|| request.ts.clone()),
            chain: serde_json::to_value(&trace.messages).unwrap_or_default(),
            tool_calls: Value::Array(
                trace
                    .messages
                    .iter()
                    .filter(|message| matches!(message, ChatMessage::Tool { .. }))
                    .filter_map(|message| serde_json::to_value(message).ok())
                    .collect(),
            ),
            agent_response: serde_json::to_value(&trace.response).ok(),
            slack_response: slack_response.clone(),
            created_at: Utc::now(),
        };
        self.logs.save(&entry).await?;

        let send = SendRequest::reply(
            SubAgent::Qa,
            request.reply_channel(),
            &request.thread_ts,
            &request.message,
            slack_response.clone(),
        );
        if let Err(dispatch_error) = self.dispatcher.send_reply(send, correlation_id).await {
            warn!(
                event_name = "qa.dispatch_failed",
                thread_id = %request.thread_ts,
                correlation_id,
                error = %dispatch_error,
            );
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(event_name = "qa.finished", thread_id = %request.thread_ts, correlation_id, elapsed_secs = elapsed);
        Ok(QaReply {
            success: true,
            processed_message: json!({
                "channel": request.channel,
                "messages": request.thread_history,
                "message_idx": request.message_idx,
                "thread_ts": request.thread_ts,
                "ts": request.ts,
            }),
            response: slack_response,
            processing_time: format!("{elapsed:.2} seconds"),
        })
    }

    /// Sender and addressees of the message. Falls back to the thread author
    /// when the channel has no known members or the model answer is unusable.
    async fn identify_participants(&self, request: &QaRequest) -> MessageParticipants {
        let author = request
            .thread_history
            .get(request.message_idx)
            .map(|entry| entry.from.clone())
            .unwrap_or_else(|| "user".to_string());
        let fallback = MessageParticipants {
            cot: String::new(),
            sender: Participant { name: author, role: None },
            receivers: Vec::new(),
        };

        let members = self.directory.members_of(&request.channel);
        if members.is_empty() {
            return fallback;
        }
        let members = serde_json::to_string_pretty(&members).unwrap_or_default();
        let prompt = match self.prompts.participants_user(&request.channel, &request.message, &members) {
            Ok(prompt) => prompt,
            Err(prompt_error) => {
                warn!(event_name = "qa.participants_failed", error = %prompt_error);
                return fallback;
            }
        };
        let llm_request = LlmRequest::new(vec![ChatMessage::human(prompt)])
            .fast()
            .with_temperature(0.0)
            .with_max_tokens(PARTICIPANTS_MAX_TOKENS);
        match complete_structured::<MessageParticipants>(self.llm.as_ref(), llm_request).await {
            Ok(participants) => participants,
            Err(llm_error) => {
                warn!(event_name = "qa.participants_failed", error = %llm_error);
                fallback
            }
        }
    }

    async fn react(
        &self,
        request: &QaRequest,
        participants: &MessageParticipants,
    ) -> Result<ReactTrace, QaError> {
        let schema = serde_json::to_string_pretty(&schema_properties::<AgentResponse>())
            .unwrap_or_else(|_| "{}".to_string());
        let sent_by = serde_json::to_string_pretty(&participants.sender).unwrap_or_default();
        let receivers = serde_json::to_string_pretty(&participants.receivers).unwrap_or_default();
        let sent_at = slack_ts_local(&request.ts, self.settings.utc_offset_minutes, true)
            .unwrap_or_else(|| request.ts.clone());
        let channel_messages = serde_json::to_string_pretty(&request.thread_history).unwrap_or_default();

        let mut messages = vec![
            ChatMessage::system(
                self.prompts.qa_system(&request.channel, &today(self.settings.utc_offset_minutes))?,
            ),
            ChatMessage::human(self.prompts.qa_user(
                &sent_by,
                &receivers,
                &sent_at,
                &channel_messages,
                &schema,
            )?),
        ];

        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.settings.recursion_limit {
                return Err(QaError::RecursionLimit(self.settings.recursion_limit));
            }
            let response = self
                .llm
                .complete(
                    LlmRequest::new(messages.clone())
                        .with_tools(self.tools.specs())
                        .with_temperature(0.0),
                )
                .await?;

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::ai(response.content.clone(), Vec::new()));
                let parsed = match parse_json_object::<AgentResponse>(&response.content) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        steps += 1;
                        if steps > self.settings.recursion_limit {
                            return Err(QaError::RecursionLimit(self.settings.recursion_limit));
                        }
                        complete_structured::<AgentResponse>(
                            self.llm.as_ref(),
                            LlmRequest::new(messages.clone()).with_temperature(0.0),
                        )
                        .await?
                    }
                };
                return Ok(ReactTrace { messages, response: parsed });
            }

            let calls = response.tool_calls.clone();
            messages.push(ChatMessage::ai(response.content, response.tool_calls));
            steps += 1;
            for call in calls {
                let output = match self.tools.get(&call.name) {
                    Some(tool) => match tool.execute(call.args.clone()).await {
                        Ok(value) => render_output(&value),
                        Err(tool_error) => {
                            warn!(event_name = "qa.tool_failed", tool = %call.name, error = %tool_error);
                            format!("Tool '{}' failed: {tool_error}", call.name)
                        }
                    },
                    None => format!("Tool '{}' failed: unknown tool", call.name),
                };
                info!(event_name = "qa.tool", thread_id = %request.thread_ts, tool = %call.name);
                messages.push(ChatMessage::tool(output, call.id));
            }
        }
    }

    async fn record_session(&self, session_id: &str, role: &str, content: &str) -> Result<(), QaError> {
        self.sessions
            .append(&SessionMessage {
                session_id: session_id.to_string(),
                role: role.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Chat text built from the structured answer.
pub fn format_slack_response(response: &AgentResponse) -> String {
    let steps = response.processing_steps.join("\n");
    let docs = response.documentation.iter().map(|link| link.url.as_str()).collect::<Vec<_>>().join("\n");
    format!("{}\n\n{STEPS_HEADING}\n\n{steps}\n\n{docs}", response.summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use serde_json::json;

    use tars_core::domain::requests::QaRequest;
    use tars_core::{AgentResponse, Link, ThreadMessage, ToolCall};
    use tars_db::repositories::{
        ConversationLogRepository, InMemoryConversationLogRepository, InMemorySessionHistoryRepository,
        SessionHistoryRepository,
    };

    use super::{format_slack_response, Employee, EmployeeDirectory, QaAgent, QaError, QaSettings};
    use crate::llm::fakes::ScriptedLlm;
    use crate::llm::LlmResponse;
    use crate::prompts::PromptLibrary;
    use crate::runtime::fakes::RecordingDispatcher;
    use crate::tools::fakes::RecordingTool;
    use crate::tools::ToolRegistry;

    const FINAL_ANSWER: &str = r#"{"main_topic": "Lambda", "intent": "debug", "analysis": "cold starts", "processing_steps": ["1. Searched docs"], "tasks": [], "documentation": [{"url": "https://docs.aws.amazon.com/lambda/", "title": "Lambda"}], "summary": "Raise the timeout."}"#;

    fn request() -> QaRequest {
        QaRequest {
            channel: "infra-team".to_string(),
            channel_id: Some("C024".to_string()),
            thread_ts: "1712322429.000200".to_string(),
            ts: "1712322429.000200".to_string(),
            thread_history: vec![ThreadMessage::new("ana", "why does my lambda time out?")],
            message_idx: 0,
            message: "why does my lambda time out?".to_string(),
        }
    }

    struct Harness {
        agent: QaAgent,
        tool: Arc<RecordingTool>,
        sessions: Arc<InMemorySessionHistoryRepository>,
        logs: Arc<InMemoryConversationLogRepository>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn harness(llm: ScriptedLlm, directory: EmployeeDirectory, recursion_limit: u32) -> Harness {
        let tool = Arc::new(RecordingTool::ok("search_documentation", json!("Lambda timeouts default to 3s")));
        let mut tools = ToolRegistry::default();
        tools.register_arc(tool.clone());
        let sessions = Arc::new(InMemorySessionHistoryRepository::default());
        let logs = Arc::new(InMemoryConversationLogRepository::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let agent = QaAgent::new(
            Arc::new(llm),
            Arc::new(PromptLibrary::new().expect("templates")),
            tools,
            directory,
            sessions.clone(),
            logs.clone(),
            dispatcher.clone(),
            QaSettings { recursion_limit, utc_offset_minutes: -300 },
        );
        Harness { agent, tool, sessions, logs, dispatcher }
    }

    #[test]
    fn slack_response_lists_steps_and_links() {
        let response = AgentResponse {
            main_topic: "S3".to_string(),
            intent: "howto".to_string(),
            analysis: String::new(),
            processing_steps: vec!["1. Read docs".to_string(), "2. Summarized".to_string()],
            tasks: Vec::new(),
            documentation: vec![Link { url: "https://a".to_string(), title: None }],
            summary: "Use versioning.".to_string(),
        };
        assert_eq!(
            format_slack_response(&response),
            "Use versioning.\n\nSteps I took to reach this answer:\n\n1. Read docs\n2. Summarized\n\nhttps://a"
        );
    }

    #[test]
    fn directory_filters_members_by_channel() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"[{{"name": "Ana", "role": "SRE", "channels_list": ["infra-team"]}}, {{"name": "Bo", "channels_list": ["random"]}}]"#
        )
        .expect("write");

        let directory = EmployeeDirectory::load(file.path()).expect("load");
        let members = directory.members_of("infra-team");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role.as_deref(), Some("SRE"));

        let missing = EmployeeDirectory::load_or_empty(std::path::Path::new("/nonexistent/employees.json"));
        assert!(missing.members_of("infra-team").is_empty());
    }

    #[tokio::test]
    async fn react_loop_uses_tools_then_answers() {
        let llm = ScriptedLlm::new([
            LlmResponse {
                content: "I will search the docs.".to_string(),
                tool_calls: vec![ToolCall::new("toolu_1", "search_documentation", json!({"search_phrase": "lambda timeout"}))],
            },
            LlmResponse { content: FINAL_ANSWER.to_string(), tool_calls: Vec::new() },
        ]);
        let h = harness(llm, EmployeeDirectory::default(), 50);

        let reply = h.agent.handle(&request(), "corr-1").await.expect("handle");

        assert!(reply.success);
        assert!(reply.response.starts_with("Raise the timeout.\n\nSteps I took to reach this answer:"));
        assert!(reply.processing_time.ends_with(" seconds"));
        assert_eq!(h.tool.calls(), vec![json!({"search_phrase": "lambda timeout"})]);

        let session = h.sessions.messages("CH#C024#TH#2024-04-05 08:07").await.expect("session");
        assert_eq!(session.iter().map(|message| message.role.as_str()).collect::<Vec<_>>(), vec!["human", "ai"]);

        let logged = h.logs.list_for_thread("infra-team", "1712322429.000200").await.expect("logs");
        assert_eq!(logged[0].message_local_time, "2024-04-05 08:07:09");
        assert_eq!(logged[0].tool_calls.as_array().map(Vec::len), Some(1));

        let sent = h.dispatcher.replies();
        assert_eq!(sent[0].args.channel, "C024");
        assert_eq!(sent[0].args.text, reply.response);
    }

    #[tokio::test]
    async fn participants_come_from_the_fast_model_when_members_are_known() {
        let llm = ScriptedLlm::new([
            LlmResponse {
                content: r#""cot": "Ana asked", "sender": {"name": "Ana", "role": "SRE"}, "receivers": []}"#.to_string(),
                tool_calls: Vec::new(),
            },
            LlmResponse { content: FINAL_ANSWER.to_string(), tool_calls: Vec::new() },
        ]);
        let directory = EmployeeDirectory::new(vec![Employee {
            name: "Ana".to_string(),
            role: Some("SRE".to_string()),
            channels_list: vec!["infra-team".to_string()],
        }]);
        let h = harness(llm, directory, 50);

        h.agent.handle(&request(), "corr-1").await.expect("handle");
        assert!(h.sessions.messages("CH#C024#TH#2024-04-05 08:07").await.expect("session").len() == 2);
    }

    #[tokio::test]
    async fn endless_tool_use_hits_the_recursion_limit() {
        let looping = (0..10).map(|index| LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new(format!("toolu_{index}"), "search_documentation", json!({}))],
        });
        let h = harness(ScriptedLlm::new(looping), EmployeeDirectory::default(), 4);

        let result = h.agent.handle(&request(), "corr-1").await;
        assert!(matches!(result, Err(QaError::RecursionLimit(4))));
        assert!(h.dispatcher.replies().is_empty());
    }
}
