//! Prompt templates rendered with tera.
//!
//! Templates live under `templates/prompts` and are compiled into the binary.

use tera::{Context, Tera};
use thiserror::Error;

const TEMPLATES: &[(&str, &str)] = &[
    ("judge_system.txt", include_str!("../../../templates/prompts/judge_system.txt")),
    ("judge_user.txt", include_str!("../../../templates/prompts/judge_user.txt")),
    ("router_user.txt", include_str!("../../../templates/prompts/router_user.txt")),
    ("architecture_system.txt", include_str!("../../../templates/prompts/architecture_system.txt")),
    (
        "architecture_contract.txt",
        include_str!("../../../templates/prompts/architecture_contract.txt"),
    ),
    ("approval_system.txt", include_str!("../../../templates/prompts/approval_system.txt")),
    ("approval_user.txt", include_str!("../../../templates/prompts/approval_user.txt")),
    ("participants_user.txt", include_str!("../../../templates/prompts/participants_user.txt")),
    ("qa_system.txt", include_str!("../../../templates/prompts/qa_system.txt")),
    ("qa_user.txt", include_str!("../../../templates/prompts/qa_user.txt")),
];

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to render prompt `{name}`: {source}")]
    Render {
        name: &'static str,
        #[source]
        source: tera::Error,
    },
    #[error("failed to load prompt templates: {0}")]
    Load(#[source] tera::Error),
}

pub struct PromptLibrary {
    tera: Tera,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES.iter().copied()).map_err(PromptError::Load)?;
        Ok(Self { tera })
    }

    fn render(&self, name: &'static str, context: &Context) -> Result<String, PromptError> {
        self.tera
            .render(name, context)
            .map(|text| text.trim_end().to_string())
            .map_err(|source| PromptError::Render { name, source })
    }

    pub fn judge_system(&self, agent_name: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("agent_name", agent_name);
        self.render("judge_system.txt", &context)
    }

    pub fn judge_user(
        &self,
        agent_name: &str,
        specification: &str,
        message: &str,
        thread_history: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("agent_name", agent_name);
        context.insert("specification", specification);
        context.insert("message_to_pay_attention", message);
        context.insert("thread_history", thread_history);
        self.render("judge_user.txt", &context)
    }

    pub fn router_user(
        &self,
        agent_name: &str,
        reasoning: &str,
        thread_history: &str,
        message: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("agent_name", agent_name);
        context.insert("reasoning", reasoning);
        context.insert("thread_history", thread_history);
        context.insert("message_to_pay_attention", message);
        self.render("router_user.txt", &context)
    }

    pub fn architecture_system(&self, today: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("today", today);
        self.render("architecture_system.txt", &context)
    }

    pub fn architecture_contract(
        &self,
        tools_catalog: &str,
        schema: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("tools_catalog", tools_catalog);
        context.insert("schema", schema);
        self.render("architecture_contract.txt", &context)
    }

    pub fn approval_system(&self, schema: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("schema", schema);
        self.render("approval_system.txt", &context)
    }

    pub fn approval_user(&self, reply: &str, proposal: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("reply", reply);
        context.insert("proposal", proposal);
        self.render("approval_user.txt", &context)
    }

    pub fn participants_user(
        &self,
        channel_name: &str,
        message: &str,
        channel_members: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("channel_name", channel_name);
        context.insert("message", message);
        context.insert("channel_members", channel_members);
        self.render("participants_user.txt", &context)
    }

    pub fn qa_system(&self, channel_name: &str, today: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("channel_name", channel_name);
        context.insert("today", today);
        self.render("qa_system.txt", &context)
    }

    pub fn qa_user(
        &self,
        sent_by: &str,
        receivers: &str,
        sent_at: &str,
        channel_messages: &str,
        output_schema: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("sent_by", sent_by);
        context.insert("receivers", receivers);
        context.insert("sent_at", sent_at);
        context.insert("channel_messages", channel_messages);
        context.insert("output_schema", output_schema);
        self.render("qa_user.txt", &context)
    }
}

#[cfg(test)]
mod tests {
    use super::PromptLibrary;

    #[test]
    fn renders_judge_prompt_without_escaping() {
        let prompts = PromptLibrary::new().expect("templates");
        let rendered = prompts
            .judge_user("TARS", "The bot was mentioned.", "<@U1> help", "alice: <@U1> help")
            .expect("render");

        assert!(rendered.starts_with("Analyze this thread and evaluate whether TARS"));
        assert!(rendered.contains("<message_to_pay_attention>\n<@U1> help\n</message_to_pay_attention>"));
    }

    #[test]
    fn contract_embeds_catalog_and_schema() {
        let prompts = PromptLibrary::new().expect("templates");
        let rendered =
            prompts.architecture_contract("-> name: call_aws", "{\"content\": {}}").expect("render");

        assert!(rendered.starts_with("TOOLS CATALOG:\n-> name: call_aws"));
        assert!(rendered.ends_with("{\"content\": {}}"));
    }
}
