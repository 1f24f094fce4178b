//! Small helpers shared by the agents: mentions, ids and local time.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};

use tars_core::ThreadMessage;

/// Whether `bot_tag` appears anywhere in the story, and whether it appears in
/// the message at `idx`.
pub fn was_bot_mentioned(story: &[ThreadMessage], bot_tag: &str, idx: usize) -> (bool, bool) {
    let anywhere = story.iter().any(|entry| entry.message.contains(bot_tag));
    let at_idx = story.get(idx).is_some_and(|entry| entry.message.contains(bot_tag));
    (anywhere, at_idx)
}

/// Id for a tool call the model described in JSON instead of calling natively.
pub fn synthetic_tool_use_id(now: DateTime<Utc>) -> String {
    now.format("tooluse_%Y%m%d%H%M%S%6f").to_string()
}

pub fn fixed_offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

pub fn local_now(utc_offset_minutes: i32) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&fixed_offset(utc_offset_minutes))
}

pub fn today(utc_offset_minutes: i32) -> String {
    local_now(utc_offset_minutes).format("%Y-%m-%d").to_string()
}

/// Parses a Slack `ts` ("1712345678.000200") into a UTC instant.
pub fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (seconds, fraction) = ts.split_once('.').unwrap_or((ts, "0"));
    let seconds = seconds.parse::<i64>().ok()?;
    let micros = format!("{fraction:0<6}").get(..6)?.parse::<u32>().ok()?;
    Utc.timestamp_opt(seconds, micros * 1_000).single()
}

/// Local rendering of a Slack `ts`, with or without seconds.
pub fn slack_ts_local(ts: &str, utc_offset_minutes: i32, with_seconds: bool) -> Option<String> {
    let pattern = if with_seconds { "%Y-%m-%d %H:%M:%S" } else { "%Y-%m-%d %H:%M" };
    parse_slack_ts(ts).map(|instant| {
        instant.with_timezone(&fixed_offset(utc_offset_minutes)).format(pattern).to_string()
    })
}

/// Session key of the research agent's chat history.
pub fn qa_session_id(channel: &str, thread_ts: &str, utc_offset_minutes: i32) -> String {
    let thread = slack_ts_local(thread_ts, utc_offset_minutes, false)
        .unwrap_or_else(|| thread_ts.to_string());
    format!("CH#{channel}#TH#{thread}")
}
