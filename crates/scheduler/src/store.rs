//! SQLite persistence for tasks and their history.
//!
//! Two relations: `tasks` (one row per task) and `task_history` (bounded
//! run log, cascade-deleted with its task). The database is opened in WAL
//! mode so timer fires and inbound tool calls read consistently while
//! writes commit. Instants are stored as RFC 3339 text.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::task::{HistoryEntry, RunStatus, Task, TaskStatus, TriggerType, HISTORY_LIMIT};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row for task {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Column list shared by the schema, the migration rebuild, and hydration.
const TASK_COLUMNS: &str = "id, trigger_type, trigger_config, mcp_server, mcp_tool, \
     mcp_arguments, agent_prompt, enabled, status, created_at, updated_at, \
     last_run, last_status, last_message, next_run";

const CREATE_TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    trigger_type TEXT NOT NULL,
    trigger_config TEXT NOT NULL,
    mcp_server TEXT,
    mcp_tool TEXT,
    mcp_arguments TEXT,
    agent_prompt TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'scheduled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_run TEXT,
    last_status TEXT,
    last_message TEXT,
    next_run TEXT
)";

const CREATE_HISTORY: &str = "CREATE TABLE IF NOT EXISTS task_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    run_at TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT
)";

const CREATE_HISTORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_history_task ON task_history(task_id)";

/// Partial update applied by [`TaskStore::update_status`].
///
/// The outer `Option` means "write this field"; the inner one carries the
/// new value, so a field can be explicitly set to NULL. The execution
/// driver stamps its running/outcome transitions through this, so the
/// lifecycle columns (`status`, `enabled`) are writable here too.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub status: Option<TaskStatus>,
    pub enabled: Option<bool>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<Option<RunStatus>>,
    pub last_message: Option<Option<String>>,
    pub next_run: Option<Option<DateTime<Utc>>>,
}

/// Task store over a SQLite pool.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if missing) the database at `path`, apply the schema,
    /// and run forward migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        store.migrate_drop_name_column().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TASKS).execute(&self.pool).await?;
        sqlx::query(CREATE_HISTORY).execute(&self.pool).await?;
        sqlx::query(CREATE_HISTORY_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Earlier schemas carried a `name` column on `tasks`. If it is present,
    /// rebuild the table without it (copy, drop, rename) in one transaction.
    async fn migrate_drop_name_column(&self) -> Result<(), StoreError> {
        let columns = sqlx::query("PRAGMA table_info(tasks)")
            .fetch_all(&self.pool)
            .await?;
        let has_name = columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "name");
        if !has_name {
            return Ok(());
        }

        info!("migrating tasks table: dropping legacy name column");

        // Foreign keys must be off so the old table can be dropped while
        // history rows still reference it; the pragma is a no-op inside a
        // transaction, so toggle it on a dedicated connection.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;

        let result: Result<(), sqlx::Error> = async {
            let mut tx = sqlx::Connection::begin(&mut *conn).await?;
            sqlx::query(&CREATE_TASKS.replace("IF NOT EXISTS tasks", "tasks_migrated"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "INSERT INTO tasks_migrated ({TASK_COLUMNS}) SELECT {TASK_COLUMNS} FROM tasks"
            ))
            .execute(&mut *tx)
            .await?;
            sqlx::query("DROP TABLE tasks").execute(&mut *tx).await?;
            sqlx::query("ALTER TABLE tasks_migrated RENAME TO tasks")
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        }
        .await;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await?;
        result?;
        Ok(())
    }

    /// Number of task rows.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Whether the tasks table has no rows (drives the legacy import).
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.count().await? == 0)
    }

    /// Whether a task row exists.
    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Atomically write the task row and replace its history rows with the
    /// task's current history, in order. No partial writes are visible.
    pub async fn upsert(&self, task: &Task) -> Result<(), StoreError> {
        let trigger_config = task.trigger_config.to_string();
        let mcp_arguments = task.mcp_arguments.as_ref().map(|v| v.to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tasks (id, trigger_type, trigger_config, mcp_server, mcp_tool, \
                 mcp_arguments, agent_prompt, enabled, status, created_at, updated_at, \
                 last_run, last_status, last_message, next_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                 trigger_type = excluded.trigger_type,
                 trigger_config = excluded.trigger_config,
                 mcp_server = excluded.mcp_server,
                 mcp_tool = excluded.mcp_tool,
                 mcp_arguments = excluded.mcp_arguments,
                 agent_prompt = excluded.agent_prompt,
                 enabled = excluded.enabled,
                 status = excluded.status,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at,
                 last_run = excluded.last_run,
                 last_status = excluded.last_status,
                 last_message = excluded.last_message,
                 next_run = excluded.next_run",
        )
        .bind(&task.id)
        .bind(task.trigger_type.as_str())
        .bind(&trigger_config)
        .bind(&task.mcp_server)
        .bind(&task.mcp_tool)
        .bind(&mcp_arguments)
        .bind(&task.agent_prompt)
        .bind(task.enabled as i64)
        .bind(task.status.as_str())
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .bind(task.last_run.map(ts))
        .bind(task.last_status.map(|s| s.as_str()))
        .bind(&task.last_message)
        .bind(task.next_run.map(ts))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM task_history WHERE task_id = ?1")
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;

        // Insert newest-first, matching the in-memory order.
        for entry in &task.history {
            sqlx::query(
                "INSERT INTO task_history (task_id, run_at, status, message) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&task.id)
            .bind(ts(entry.run_at))
            .bind(entry.status.as_str())
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch one task with its history attached (newest first).
    pub async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let history = self.history_of(id).await?;
                Ok(Some(hydrate(&row, history)?))
            }
            None => Ok(None),
        }
    }

    /// All tasks ordered by creation time (oldest first), histories attached.
    pub async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let history = self.history_of(&id).await?;
            tasks.push(hydrate(&row, history)?);
        }
        Ok(tasks)
    }

    /// Delete a task (history cascades). Returns whether a row existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Partial update of the run-state columns; `updated_at` is always
    /// touched. Returns whether the row existed.
    pub async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, enabled, last_run, last_status, last_message, next_run \
             FROM tasks WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let row = match row {
            Some(r) => r,
            None => return Ok(false),
        };

        let status = match update.status {
            Some(v) => v.as_str().to_string(),
            None => row.get::<String, _>("status"),
        };
        let enabled = match update.enabled {
            Some(v) => v as i64,
            None => row.get::<i64, _>("enabled"),
        };
        let last_run = match update.last_run {
            Some(v) => Some(ts(v)),
            None => row.get::<Option<String>, _>("last_run"),
        };
        let last_status = match update.last_status {
            Some(v) => v.map(|s| s.as_str().to_string()),
            None => row.get::<Option<String>, _>("last_status"),
        };
        let last_message = match update.last_message {
            Some(v) => v,
            None => row.get::<Option<String>, _>("last_message"),
        };
        let next_run = match update.next_run {
            Some(v) => v.map(ts),
            None => row.get::<Option<String>, _>("next_run"),
        };

        sqlx::query(
            "UPDATE tasks SET status = ?2, enabled = ?3, last_run = ?4, last_status = ?5, \
             last_message = ?6, next_run = ?7, updated_at = ?8 WHERE id = ?1",
        )
        .bind(id)
        .bind(status)
        .bind(enabled)
        .bind(last_run)
        .bind(last_status)
        .bind(last_message)
        .bind(next_run)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Append one history entry for a task and prune to the retention cap.
    /// Returns whether the task row existed (a vanished task is a no-op).
    pub async fn append_history(&self, id: &str, entry: &HistoryEntry) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO task_history (task_id, run_at, status, message) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(ts(entry.run_at))
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM task_history WHERE task_id = ?1 AND id NOT IN ( \
                 SELECT id FROM task_history WHERE task_id = ?1 \
                 ORDER BY run_at DESC, id ASC LIMIT ?2)",
        )
        .bind(id)
        .bind(HISTORY_LIMIT as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Remove all history rows and clear the last-run fields.
    pub async fn clear_history(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM task_history WHERE task_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE tasks SET last_run = NULL, last_status = NULL, last_message = NULL, \
             updated_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn history_of(&self, id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_at, status, message FROM task_history \
             WHERE task_id = ?1 ORDER BY run_at DESC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let run_at_raw: String = row.get("run_at");
            let status_raw: String = row.get("status");
            let run_at = parse_ts(&run_at_raw).ok_or_else(|| StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("bad history run_at '{run_at_raw}'"),
            })?;
            let status = RunStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("bad history status '{status_raw}'"),
            })?;
            history.push(HistoryEntry {
                run_at,
                status,
                message: row.get("message"),
            });
        }
        Ok(history)
    }
}

// ── Row hydration ───────────────────────────────────────────────────

fn hydrate(row: &sqlx::sqlite::SqliteRow, history: Vec<HistoryEntry>) -> Result<Task, StoreError> {
    let id: String = row.get("id");

    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let trigger_type_raw: String = row.get("trigger_type");
    let trigger_type = TriggerType::parse(&trigger_type_raw)
        .ok_or_else(|| corrupt(format!("bad trigger_type '{trigger_type_raw}'")))?;

    let trigger_config_raw: String = row.get("trigger_config");
    let trigger_config = serde_json::from_str(&trigger_config_raw)
        .map_err(|e| corrupt(format!("bad trigger_config: {e}")))?;

    let status_raw: String = row.get("status");
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| corrupt(format!("bad status '{status_raw}'")))?;

    let last_status = match row.get::<Option<String>, _>("last_status") {
        Some(raw) => {
            Some(RunStatus::parse(&raw).ok_or_else(|| corrupt(format!("bad last_status '{raw}'")))?)
        }
        None => None,
    };

    let mcp_arguments = match row.get::<Option<String>, _>("mcp_arguments") {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|e| corrupt(format!("bad mcp_arguments: {e}")))?)
        }
        None => None,
    };

    let required_ts = |col: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw: String = row.get(col);
        parse_ts(&raw).ok_or_else(|| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("bad {col} '{raw}'"),
        })
    };
    let optional_ts = |col: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        match row.get::<Option<String>, _>(col) {
            Some(raw) => parse_ts(&raw)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt {
                    id: id.clone(),
                    reason: format!("bad {col} '{raw}'"),
                }),
            None => Ok(None),
        }
    };

    let created_at = required_ts("created_at")?;
    let updated_at = required_ts("updated_at")?;
    let last_run = optional_ts("last_run")?;
    let next_run = optional_ts("next_run")?;

    Ok(Task {
        id,
        name: None,
        trigger_type,
        trigger_config,
        mcp_server: row.get("mcp_server"),
        mcp_tool: row.get("mcp_tool"),
        mcp_arguments,
        agent_prompt: row.get("agent_prompt"),
        enabled: row.get::<i64, _>("enabled") != 0,
        status,
        created_at,
        updated_at,
        last_run,
        last_status,
        last_message: row.get("last_message"),
        next_run,
        history,
    })
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = %raw, error = %e, "unparseable stored timestamp");
            None
        }
    }
}
