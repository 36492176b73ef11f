//! Integration tests for the SQLite task store: upsert semantics, cascade
//! delete, the drop-`name` schema migration, and the legacy file import.

use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use metronome_scheduler::store::{StatusUpdate, TaskStore};
use metronome_scheduler::task::{HistoryEntry, RunStatus, Task, TaskStatus, TriggerType};
use metronome_scheduler::legacy;

fn sample_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        name: None,
        trigger_type: TriggerType::Interval,
        trigger_config: json!({"seconds": 30.0}),
        mcp_server: None,
        mcp_tool: None,
        mcp_arguments: None,
        agent_prompt: Some("check the logs".to_string()),
        enabled: true,
        status: TaskStatus::Scheduled,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        last_run: None,
        last_status: None,
        last_message: None,
        next_run: Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 30).unwrap()),
        history: vec![
            HistoryEntry {
                run_at: Utc.with_ymd_and_hms(2025, 5, 31, 23, 59, 30).unwrap(),
                status: RunStatus::Success,
                message: Some("ok".to_string()),
            },
            HistoryEntry {
                run_at: Utc.with_ymd_and_hms(2025, 5, 31, 23, 59, 0).unwrap(),
                status: RunStatus::Error,
                message: Some("boom".to_string()),
            },
        ],
    }
}

async fn open_store(dir: &TempDir) -> TaskStore {
    TaskStore::open(&dir.path().join("tasks.db")).await.unwrap()
}

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let task = sample_task("task-1-aaaaaaa");
    store.upsert(&task).await.unwrap();

    let loaded = store.get("task-1-aaaaaaa").await.unwrap().unwrap();
    assert_eq!(loaded.trigger_type, TriggerType::Interval);
    assert_eq!(loaded.trigger_config, json!({"seconds": 30.0}));
    assert_eq!(loaded.agent_prompt.as_deref(), Some("check the logs"));
    assert_eq!(loaded.next_run, task.next_run);
    assert_eq!(loaded.history.len(), 2);
    // Newest first.
    assert_eq!(loaded.history[0].status, RunStatus::Success);
    assert_eq!(loaded.history[1].message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let task = sample_task("task-2-bbbbbbb");
    store.upsert(&task).await.unwrap();
    store.upsert(&task).await.unwrap();

    let loaded = store.get("task-2-bbbbbbb").await.unwrap().unwrap();
    assert_eq!(loaded.history.len(), 2);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn list_orders_by_created_at_ascending() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut newer = sample_task("task-newer");
    newer.created_at = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
    let older = sample_task("task-older");
    store.upsert(&newer).await.unwrap();
    store.upsert(&older).await.unwrap();

    let ids: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["task-older".to_string(), "task-newer".to_string()]);
}

#[tokio::test]
async fn delete_cascades_history() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let task = sample_task("task-3-ccccccc");
    store.upsert(&task).await.unwrap();
    assert!(store.delete("task-3-ccccccc").await.unwrap());
    assert!(!store.delete("task-3-ccccccc").await.unwrap());
    assert!(store.get("task-3-ccccccc").await.unwrap().is_none());

    // The history rows are gone too, not just orphaned.
    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new().filename(dir.path().join("tasks.db")),
    )
    .await
    .unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_history")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn update_status_writes_only_present_fields() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let task = sample_task("task-4-ddddddd");
    store.upsert(&task).await.unwrap();

    let run_at = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
    store
        .update_status(
            "task-4-ddddddd",
            StatusUpdate {
                status: None,
                enabled: None,
                last_run: Some(run_at),
                last_status: Some(Some(RunStatus::Success)),
                last_message: Some(Some("done".to_string())),
                next_run: None,
            },
        )
        .await
        .unwrap();

    let loaded = store.get("task-4-ddddddd").await.unwrap().unwrap();
    assert_eq!(loaded.last_run, Some(run_at));
    assert_eq!(loaded.last_status, Some(RunStatus::Success));
    assert_eq!(loaded.last_message.as_deref(), Some("done"));
    // Untouched field keeps its value.
    assert_eq!(loaded.next_run, task.next_run);
    // updated_at is always touched.
    assert!(loaded.updated_at > task.updated_at);

    // Explicit null clears a field.
    store
        .update_status(
            "task-4-ddddddd",
            StatusUpdate {
                last_message: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let loaded = store.get("task-4-ddddddd").await.unwrap().unwrap();
    assert!(loaded.last_message.is_none());
    assert_eq!(loaded.last_status, Some(RunStatus::Success));

    // Lifecycle columns are writable too (the fire stamp path).
    store
        .update_status(
            "task-4-ddddddd",
            StatusUpdate {
                status: Some(TaskStatus::Completed),
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let loaded = store.get("task-4-ddddddd").await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Completed);
    assert!(!loaded.enabled);

    assert!(!store
        .update_status("no-such-task", StatusUpdate::default())
        .await
        .unwrap());
}

#[tokio::test]
async fn append_history_prepends_and_prunes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut task = sample_task("task-6-fffffff");
    task.history.clear();
    store.upsert(&task).await.unwrap();

    for i in 0..13 {
        let appended = store
            .append_history(
                "task-6-fffffff",
                &HistoryEntry {
                    run_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, i).unwrap(),
                    status: RunStatus::Success,
                    message: Some(format!("run {i}")),
                },
            )
            .await
            .unwrap();
        assert!(appended);
    }

    let loaded = store.get("task-6-fffffff").await.unwrap().unwrap();
    assert_eq!(loaded.history.len(), 10);
    // Newest first; the three oldest runs were pruned.
    assert_eq!(loaded.history[0].message.as_deref(), Some("run 12"));
    assert_eq!(loaded.history[9].message.as_deref(), Some("run 3"));

    assert!(!store
        .append_history(
            "no-such-task",
            &HistoryEntry {
                run_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
                status: RunStatus::Error,
                message: None,
            },
        )
        .await
        .unwrap());
}

#[tokio::test]
async fn clear_history_resets_last_run_fields() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut task = sample_task("task-5-eeeeeee");
    task.last_run = Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    task.last_status = Some(RunStatus::Error);
    task.last_message = Some("boom".to_string());
    store.upsert(&task).await.unwrap();

    assert!(store.clear_history("task-5-eeeeeee").await.unwrap());
    let loaded = store.get("task-5-eeeeeee").await.unwrap().unwrap();
    assert!(loaded.history.is_empty());
    assert!(loaded.last_run.is_none());
    assert!(loaded.last_status.is_none());
    assert!(loaded.last_message.is_none());

    assert!(!store.clear_history("no-such-task").await.unwrap());
}

#[tokio::test]
async fn migration_drops_legacy_name_column() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");

    // Seed a database with the earlier schema (name column present).
    {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                name TEXT,
                trigger_type TEXT NOT NULL,
                trigger_config TEXT NOT NULL,
                mcp_server TEXT, mcp_tool TEXT, mcp_arguments TEXT, agent_prompt TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                last_run TEXT, last_status TEXT, last_message TEXT, next_run TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, name, trigger_type, trigger_config, enabled, status, created_at, updated_at)
             VALUES ('task-old-1', 'legacy name', 'interval', '{\"seconds\": 60.0}', 1, 'scheduled',
                     '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    let store = TaskStore::open(&path).await.unwrap();
    let task = store.get("task-old-1").await.unwrap().unwrap();
    assert_eq!(task.trigger_type, TriggerType::Interval);
    assert_eq!(task.trigger_config, json!({"seconds": 60.0}));

    // The rebuilt table has no name column.
    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&path))
        .await
        .unwrap();
    let columns = sqlx::query("PRAGMA table_info(tasks)")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(columns
        .iter()
        .all(|row| row.get::<String, _>("name") != "name"));
}

#[tokio::test]
async fn legacy_file_imported_once_and_renamed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let legacy_path = dir.path().join("tasks.json");

    std::fs::write(
        &legacy_path,
        r#"[{"trigger_type": "interval", "trigger_config": {"minutes": 5}, "agent_prompt": "ping"}]"#,
    )
    .unwrap();

    let imported = legacy::import_if_empty(&store, &legacy_path).await.unwrap();
    assert_eq!(imported, 1);

    let tasks = store.list().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Scheduled);
    assert!(tasks[0].history.is_empty());
    assert_eq!(tasks[0].agent_prompt.as_deref(), Some("ping"));

    assert!(!legacy_path.exists());
    assert!(dir.path().join("tasks.json.bak").exists());

    // Non-empty store: a second import is a no-op.
    std::fs::write(
        &legacy_path,
        r#"[{"trigger_type": "cron", "trigger_config": {"expression": "0 9 * * *"}}]"#,
    )
    .unwrap();
    let imported = legacy::import_if_empty(&store, &legacy_path).await.unwrap();
    assert_eq!(imported, 0);
    assert!(legacy_path.exists());
}

#[tokio::test]
async fn legacy_parse_failure_does_not_abort() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let legacy_path = dir.path().join("tasks.json");
    std::fs::write(&legacy_path, "not json at all").unwrap();

    let imported = legacy::import_if_empty(&store, &legacy_path).await.unwrap();
    assert_eq!(imported, 0);
    // The unparseable file stays put for inspection.
    assert!(legacy_path.exists());
}
