//! The per-fire execution pipeline.
//!
//! A fire marks the task running, performs its action (a reverse sampling
//! RPC when an `agent_prompt` is configured and a peer is connected, a
//! recorded no-op otherwise), then persists the outcome: last-run fields,
//! a history entry, the recomputed `next_run`, and the lifecycle status.
//! A `date` task self-terminates after a successful fire. Failures are
//! captured here and persisted; they never propagate past the fire.

use std::time::Duration;

use metronome_core::time;
use metronome_mcp::{CreateMessageParams, McpError};
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::scheduler::SchedulerInner;
use crate::store::StatusUpdate;
use crate::task::{HistoryEntry, RunStatus, TaskStatus};

/// Token limit sent with every sampling request.
pub const SAMPLING_MAX_TOKENS: u32 = 2000;

/// Result of one fire, as reported to a manual `execute_task` caller.
#[derive(Debug, Clone)]
pub struct FireOutcome {
    pub success: bool,
    pub message: String,
}

/// Run one fire to completion. The caller must hold the task's fire lock.
pub(crate) async fn fire_task(
    inner: &SchedulerInner,
    id: &str,
) -> Result<FireOutcome, SchedulerError> {
    let mut task = inner
        .store
        .get(id)
        .await?
        .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
    task.name = inner.name_of(id).await;

    let started = time::now();
    task.status = TaskStatus::Running;
    task.last_run = Some(started);
    task.last_status = Some(RunStatus::Running);
    task.last_message = None;
    task.updated_at = started;
    let stamped = inner
        .store
        .update_status(
            id,
            StatusUpdate {
                status: Some(TaskStatus::Running),
                last_run: Some(started),
                last_status: Some(Some(RunStatus::Running)),
                last_message: Some(None),
                ..Default::default()
            },
        )
        .await?;
    if !stamped {
        return Err(SchedulerError::NotFound(id.to_string()));
    }
    info!(task_id = %id, "fire started");

    let outcome = perform_action(inner, &task).await;

    let finished = time::now();
    let (success, message) = match outcome {
        Ok(message) => (true, message),
        Err(message) => (false, message),
    };

    let entry = HistoryEntry {
        run_at: started,
        status: if success {
            RunStatus::Success
        } else {
            RunStatus::Error
        },
        message: Some(message.clone()),
    };
    task.push_history(entry.clone());
    task.last_status = Some(if success {
        RunStatus::Success
    } else {
        RunStatus::Error
    });
    task.last_message = Some(message.clone());
    task.updated_at = finished;

    // Derive the post-fire lifecycle state through normalization: a date
    // task whose newest entry is a success completes (and disables), an
    // error surfaces as status=error with the trigger replanned, everything
    // else returns to scheduled.
    task.status = TaskStatus::Scheduled;
    crate::scheduler::normalize(inner, &mut task, finished);

    // Best-effort persistence: a task deleted mid-fire reports "gone" from
    // update_status and the outcome is dropped, never resurrected.
    let outcome_update = StatusUpdate {
        status: Some(task.status),
        enabled: Some(task.enabled),
        last_status: Some(task.last_status),
        last_message: Some(task.last_message.clone()),
        next_run: Some(task.next_run),
        ..Default::default()
    };
    if inner.store.update_status(id, outcome_update).await? {
        inner.store.append_history(id, &entry).await?;
    } else {
        debug!(task_id = %id, "task deleted during fire, dropping outcome");
    }

    info!(task_id = %id, success = success, "fire finished");
    Ok(FireOutcome { success, message })
}

/// Perform the fire's action and produce the outcome message.
async fn perform_action(
    inner: &SchedulerInner,
    task: &crate::task::Task,
) -> Result<String, String> {
    if let Some(prompt) = &task.agent_prompt {
        if let Some(client) = inner.sampling_client() {
            let params = CreateMessageParams::user_text(prompt.clone(), SAMPLING_MAX_TOKENS);
            return match client.create_message(params, inner.sampling_timeout).await {
                Ok(result) => Ok(format!("Sampling response: {}", result.content_text())),
                Err(McpError::Timeout(elapsed)) => Err(timeout_message(elapsed)),
                Err(e) => Err(e.to_string()),
            };
        }
        debug!(task_id = %task.id, "agent_prompt set but no sampling channel available");
    } else if task.has_legacy_tool_config() {
        info!(
            task_id = %task.id,
            mcp_server = task.mcp_server.as_deref().unwrap_or("-"),
            mcp_tool = task.mcp_tool.as_deref().unwrap_or("-"),
            "legacy tool configuration present, not invoked"
        );
        return Ok(format!(
            "Task executed: {} (legacy tool configuration ignored)",
            task.display_name()
        ));
    }

    Ok(format!(
        "Task executed: {} (no action configured)",
        task.display_name()
    ))
}

/// Canonical timeout message; the duration is reported in whole seconds.
fn timeout_message(timeout: Duration) -> String {
    let secs = (timeout.as_millis() as f64 / 1000.0).round() as u64;
    format!("Sampling request timed out after {secs}s")
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_rounds_to_seconds() {
        assert_eq!(
            timeout_message(Duration::from_millis(180_000)),
            "Sampling request timed out after 180s"
        );
        assert_eq!(
            timeout_message(Duration::from_millis(50)),
            "Sampling request timed out after 0s"
        );
        assert_eq!(
            timeout_message(Duration::from_millis(1_500)),
            "Sampling request timed out after 2s"
        );
    }
}
