//! Operator access to the HITL checkpoint store.

use chrono::Utc;
use serde_json::{json, Value};
use tars_core::Checkpoint;
use tars_db::repositories::{CheckpointRepository, SqlCheckpointRepository, ThreadSummary};

use crate::commands::{with_database, CommandResult};

pub fn list() -> CommandResult {
    with_database("checkpoints.list", |pool| async move {
        let threads = SqlCheckpointRepository::new(pool).list_threads(Utc::now()).await?;
        let data: Vec<Value> = threads.iter().map(summary_json).collect();
        Ok(CommandResult::success_with_data(
            "checkpoints.list",
            format!("{} thread(s) with live checkpoints", data.len()),
            Value::Array(data),
        ))
    })
}

pub fn show(thread_id: &str) -> CommandResult {
    let thread_id = thread_id.to_string();
    with_database("checkpoints.show", |pool| async move {
        let history = SqlCheckpointRepository::new(pool).history(&thread_id).await?;
        if history.is_empty() {
            return Ok(CommandResult::failure(
                "checkpoints.show",
                "not_found",
                format!("no checkpoints for thread `{thread_id}`"),
                1,
            ));
        }
        let data: Vec<Value> = history.iter().map(checkpoint_json).collect();
        Ok(CommandResult::success_with_data(
            "checkpoints.show",
            format!("{} checkpoint(s) for thread `{thread_id}`", data.len()),
            Value::Array(data),
        ))
    })
}

pub fn clear(thread_id: &str) -> CommandResult {
    let thread_id = thread_id.to_string();
    with_database("checkpoints.clear", |pool| async move {
        let removed = SqlCheckpointRepository::new(pool).delete_thread(&thread_id).await?;
        Ok(CommandResult::success_with_data(
            "checkpoints.clear",
            format!("removed {removed} checkpoint(s) for thread `{thread_id}`"),
            json!({ "thread_id": thread_id, "removed": removed }),
        ))
    })
}

pub fn prune() -> CommandResult {
    with_database("checkpoints.prune", |pool| async move {
        let pruned = SqlCheckpointRepository::new(pool).prune_expired(Utc::now()).await?;
        Ok(CommandResult::success_with_data(
            "checkpoints.prune",
            format!("pruned {pruned} expired checkpoint(s)"),
            json!({ "pruned": pruned }),
        ))
    })
}

fn summary_json(summary: &ThreadSummary) -> Value {
    json!({
        "thread_id": summary.thread_id,
        "checkpoints": summary.checkpoints,
        "latest_sequence": summary.latest_sequence,
        "next_node": summary.next_node,
        "interrupt_type": summary.interrupt_type,
        "updated_at": summary.updated_at.to_rfc3339(),
        "expires_at": summary.expires_at.to_rfc3339(),
    })
}

fn checkpoint_json(checkpoint: &Checkpoint) -> Value {
    json!({
        "checkpoint_id": checkpoint.checkpoint_id,
        "sequence": checkpoint.sequence,
        "node": checkpoint.node,
        "next": checkpoint.next,
        "interrupt": checkpoint.interrupt,
        "messages": checkpoint.state.messages.len(),
        "created_at": checkpoint.created_at.to_rfc3339(),
        "expires_at": checkpoint.expires_at.to_rfc3339(),
    })
}
