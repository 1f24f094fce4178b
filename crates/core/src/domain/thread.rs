use serde::{Deserialize, Serialize};

/// One entry of a thread story: who said what, in thread order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub from: String,
    pub message: String,
}

impl ThreadMessage {
    pub fn new(from: impl Into<String>, message: impl Into<String>) -> Self {
        Self { from: from.into(), message: message.into() }
    }
}

/// Key used to deduplicate deferred evaluations of the same Slack message.
pub fn message_id(channel: &str, ts: &str) -> String {
    format!("{channel}_{ts}")
}

pub fn bot_tag(bot_user_id: &str) -> String {
    format!("<@{bot_user_id}>")
}

/// Renders a story the way prompts consume it: one `from: message` line each.
pub fn render_story(story: &[ThreadMessage]) -> String {
    story
        .iter()
        .map(|entry| format!("{}: {}", entry.from, entry.message))
        .collect::<Vec<_>>()
        .join("\n")
}
