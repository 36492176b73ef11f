//! The task model.
//!
//! A [`Task`] is the unit of scheduling: a trigger, an optional agent
//! prompt, lifecycle state, and a bounded run history. The serde shape of
//! this struct is the wire shape returned by the tools (before the describe
//! projection adds localized fields).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of history entries retained per task.
pub const HISTORY_LIMIT: usize = 10;

// ── Enums ───────────────────────────────────────────────────────────

/// Which trigger family governs a task's firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Interval,
    Cron,
    Date,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
            Self::Date => "date",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interval" => Some(Self::Interval),
            "cron" => Some(Self::Cron),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Observable outcome of a fire. History entries only ever carry
/// `Success` or `Error`; `Running` appears transiently in `last_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Running,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "running" => Some(Self::Running),
            _ => None,
        }
    }
}

// ── History ─────────────────────────────────────────────────────────

/// One recorded fire, newest-first in [`Task::history`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Task ────────────────────────────────────────────────────────────

/// A scheduled task with its full hydrated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Display name, held in memory only: the persisted schema carries no
    /// name column, so after a restart execution messages fall back to the
    /// id. Never serialized.
    #[serde(skip)]
    pub name: Option<String>,
    pub trigger_type: TriggerType,
    /// Canonical trigger configuration (materialized at registration).
    pub trigger_config: Value,
    /// Legacy fields retained from the earlier tool-invoking layout.
    /// They are inert: logged when a fire encounters them, never invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_prompt: Option<String>,
    pub enabled: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Task {
    /// Name for execution messages: the in-memory name, else the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether either legacy tool field is set.
    pub fn has_legacy_tool_config(&self) -> bool {
        self.mcp_server.is_some() || self.mcp_tool.is_some()
    }

    /// Prepend a history entry (newest first) and enforce the cap.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.insert(0, entry);
        self.history.truncate(HISTORY_LIMIT);
    }
}

/// Generate a fresh task id: `task-<unix-millis>-<7-char-random-alphanum>`.
pub fn generate_task_id(now: DateTime<Utc>) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("task-{}-{}", now.timestamp_millis(), suffix)
}

// ── Tool-surface parameter shapes ───────────────────────────────────

/// Arguments accepted by `create_task`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskParams {
    pub name: String,
    pub trigger_type: String,
    pub trigger_config: Value,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub mcp_server: Option<String>,
    #[serde(default)]
    pub mcp_tool: Option<String>,
    #[serde(default)]
    pub mcp_arguments: Option<Value>,
}

/// Arguments accepted by `update_task` (all optional except the id).
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTaskParams {
    pub task_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub mcp_server: Option<String>,
    #[serde(default)]
    pub mcp_tool: Option<String>,
    #[serde(default)]
    pub mcp_arguments: Option<Value>,
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(secs: i64, status: RunStatus) -> HistoryEntry {
        HistoryEntry {
            run_at: Utc.timestamp_opt(secs, 0).unwrap(),
            status,
            message: None,
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "task-1700000000000-abc1234".to_string(),
            name: Some("heartbeat".to_string()),
            trigger_type: TriggerType::Interval,
            trigger_config: serde_json::json!({"seconds": 1}),
            mcp_server: None,
            mcp_tool: None,
            mcp_arguments: None,
            agent_prompt: None,
            enabled: true,
            status: TaskStatus::Scheduled,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            last_run: None,
            last_status: None,
            last_message: None,
            next_run: None,
            history: Vec::new(),
        }
    }

    #[test]
    fn test_history_cap_drops_oldest() {
        let mut task = sample_task();
        for i in 0..15 {
            task.push_history(entry(i, RunStatus::Success));
        }
        assert_eq!(task.history.len(), HISTORY_LIMIT);
        // Newest first: the last pushed entry leads.
        assert_eq!(task.history[0].run_at.timestamp(), 14);
        assert_eq!(task.history[9].run_at.timestamp(), 5);
    }

    #[test]
    fn test_name_is_not_serialized() {
        let task = sample_task();
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("name").is_none());
        assert_eq!(json["id"], "task-1700000000000-abc1234");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let mut task = sample_task();
        assert_eq!(task.display_name(), "heartbeat");
        task.name = None;
        assert_eq!(task.display_name(), "task-1700000000000-abc1234");
    }

    #[test]
    fn test_status_enum_round_trip() {
        for s in ["scheduled", "running", "paused", "completed", "error"] {
            let parsed = TaskStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
            let json = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
        assert!(TaskStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_generate_task_id_format() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let id = generate_task_id(now);
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "task");
        assert_eq!(parts[1], "1700000000000");
        assert_eq!(parts[2].len(), 7);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_task_wire_shape_omits_empty_options() {
        let task = sample_task();
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("agent_prompt"));
        assert!(!json.contains("mcp_server"));
        assert!(!json.contains("last_run"));
    }
}
