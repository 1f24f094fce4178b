use chrono::Utc;
use serde_json::{json, Value};
use tars_core::{PendingEvaluation, QueueStatus};
use tars_db::repositories::{EvaluationQueueRepository, SqlEvaluationQueueRepository};

use crate::commands::{with_database, CommandResult};

pub fn list(status: Option<&str>) -> CommandResult {
    let status = match status.map(str::parse::<QueueStatus>).transpose() {
        Ok(status) => status,
        Err(error) => return CommandResult::failure("queue.list", "invalid_argument", error, 2),
    };

    with_database("queue.list", |pool| async move {
        let entries = SqlEvaluationQueueRepository::new(pool).list(status).await?;
        let data: Vec<Value> = entries.iter().map(entry_json).collect();
        Ok(CommandResult::success_with_data(
            "queue.list",
            format!("{} queued evaluation(s)", data.len()),
            Value::Array(data),
        ))
    })
}

/// Puts a dead-lettered evaluation back on the queue.
pub fn retry(message_id: &str) -> CommandResult {
    let message_id = message_id.to_string();
    with_database("queue.retry", |pool| async move {
        let requeued = SqlEvaluationQueueRepository::new(pool).requeue(&message_id, Utc::now()).await?;
        if !requeued {
            return Ok(CommandResult::failure(
                "queue.retry",
                "not_found",
                format!("no dead-lettered evaluation `{message_id}`"),
                1,
            ));
        }
        Ok(CommandResult::success_with_data(
            "queue.retry",
            format!("requeued `{message_id}`"),
            json!({ "message_id": message_id }),
        ))
    })
}

fn entry_json(entry: &PendingEvaluation) -> Value {
    json!({
        "message_id": entry.message_id,
        "channel": entry.channel,
        "thread_ts": entry.request.thread_ts,
        "status": entry.status.as_str(),
        "attempts": entry.attempts,
        "deliver_after": entry.deliver_after.to_rfc3339(),
        "last_error": entry.last_error,
    })
}
