//! One-shot import of the legacy free-form task file.
//!
//! Before the SQLite layout, tasks lived in a single JSON file. When the
//! database is empty at startup, that file (if present) is imported: each
//! record is coerced into the current task shape, then the file is renamed
//! with a `.bak` suffix. A record that cannot be coerced is logged and
//! skipped; a file that cannot be parsed at all is left in place. Neither
//! case aborts startup.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::store::{StoreError, TaskStore};
use crate::task::{
    generate_task_id, HistoryEntry, RunStatus, Task, TaskStatus, TriggerType, HISTORY_LIMIT,
};

/// Import the legacy file at `path` if the store is empty.
///
/// Returns the number of imported tasks (0 when nothing was done).
pub async fn import_if_empty(store: &TaskStore, path: &Path) -> Result<usize, StoreError> {
    if !store.is_empty().await? {
        return Ok(0);
    }
    if !path.exists() {
        return Ok(0);
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read legacy task file");
            return Ok(0);
        }
    };

    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot parse legacy task file");
            return Ok(0);
        }
    };

    // Accept both a bare array and an object wrapping a `tasks` array.
    let records = match &parsed {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("tasks").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => {
                warn!(path = %path.display(), "legacy task file has no task array");
                return Ok(0);
            }
        },
        _ => {
            warn!(path = %path.display(), "legacy task file is not an array or object");
            return Ok(0);
        }
    };

    let now = Utc::now();
    let mut imported = 0usize;
    for record in records {
        match coerce_record(record, now) {
            Some(task) => {
                store.upsert(&task).await?;
                imported += 1;
            }
            None => warn!("skipping malformed legacy task record"),
        }
    }

    // Keep the original out of future startups.
    let backup = backup_path(path);
    if let Err(e) = std::fs::rename(path, &backup) {
        warn!(path = %path.display(), error = %e, "could not rename legacy task file");
    }

    info!(
        count = imported,
        path = %path.display(),
        "imported legacy tasks"
    );
    Ok(imported)
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    std::path::PathBuf::from(name)
}

/// Coerce one legacy record into the current task shape.
///
/// `trigger_type` and an object `trigger_config` are required; everything
/// else gets the documented defaults (`status` → scheduled, empty history).
fn coerce_record(record: &Value, now: DateTime<Utc>) -> Option<Task> {
    let obj = record.as_object()?;

    let trigger_type = TriggerType::parse(obj.get("trigger_type")?.as_str()?)?;
    let trigger_config = obj.get("trigger_config")?.clone();
    if !trigger_config.is_object() {
        return None;
    }

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| generate_task_id(now));

    let str_field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
    let ts_field = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    let status = str_field("status")
        .and_then(|s| TaskStatus::parse(&s))
        .unwrap_or(TaskStatus::Scheduled);

    let mut history: Vec<HistoryEntry> = obj
        .get("history")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let run_at = e
                        .get("run_at")
                        .and_then(Value::as_str)
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
                        .with_timezone(&Utc);
                    let status = RunStatus::parse(e.get("status")?.as_str()?)?;
                    Some(HistoryEntry {
                        run_at,
                        status,
                        message: e.get("message").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    history.truncate(HISTORY_LIMIT);

    Some(Task {
        id,
        name: None,
        trigger_type,
        trigger_config,
        mcp_server: str_field("mcp_server"),
        mcp_tool: str_field("mcp_tool"),
        mcp_arguments: obj.get("mcp_arguments").filter(|v| !v.is_null()).cloned(),
        agent_prompt: str_field("agent_prompt"),
        enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        status,
        created_at: ts_field("created_at").unwrap_or(now),
        updated_at: ts_field("updated_at").unwrap_or(now),
        last_run: ts_field("last_run"),
        last_status: str_field("last_status").and_then(|s| RunStatus::parse(&s)),
        last_message: str_field("last_message"),
        next_run: ts_field("next_run"),
        history,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
