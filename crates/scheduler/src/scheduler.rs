//! The scheduler core: task lifecycle verbs and timer ownership.
//!
//! Two disjoint timer registries are kept, one for cron schedules and one
//! for interval/date clocks, each holding an abortable tokio task per
//! armed trigger. Every mutation goes unarm-then-arm so a timer can never
//! leak across an update, pause, or delete. Fires are serialized per task
//! by a lock map: scheduled ticks that find the lock held are dropped
//! (the next fire lands one period later), while a manual execute waits
//! for the in-flight fire to finish.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metronome_core::time;
use metronome_mcp::SamplingClient;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::executor::{self, FireOutcome};
use crate::store::TaskStore;
use crate::task::{
    generate_task_id, CreateTaskParams, RunStatus, Task, TaskStatus, TriggerType,
    UpdateTaskParams, HISTORY_LIMIT,
};
use crate::trigger::{self, CronConfig, IntervalConfig};

/// Shared scheduler state; timer tasks hold an `Arc` of this.
pub(crate) struct SchedulerInner {
    pub(crate) store: TaskStore,
    pub(crate) tz: Tz,
    pub(crate) sampling_timeout: Duration,
    /// Reverse-RPC channel, wired after the transport connects.
    sampling: RwLock<Option<Arc<dyn SamplingClient>>>,
    /// In-memory display names (the schema persists none).
    names: Mutex<HashMap<String, String>>,
    /// Armed cron schedules, keyed by task id.
    cron_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Armed interval and one-shot date clocks, keyed by task id.
    clock_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Per-task fire serialization.
    fire_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SchedulerInner {
    pub(crate) fn sampling_client(&self) -> Option<Arc<dyn SamplingClient>> {
        self.sampling.read().ok().and_then(|guard| guard.clone())
    }

    pub(crate) async fn name_of(&self, id: &str) -> Option<String> {
        self.names.lock().await.get(id).cloned()
    }

    async fn fire_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.fire_locks
                .lock()
                .await
                .entry(id.to_string())
                .or_default(),
        )
    }
}

/// The scheduler. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: TaskStore, tz: Tz, sampling_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                tz,
                sampling_timeout,
                sampling: RwLock::new(None),
                names: Mutex::new(HashMap::new()),
                cron_timers: Mutex::new(HashMap::new()),
                clock_timers: Mutex::new(HashMap::new()),
                fire_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire the reverse-RPC channel once the transport is connected.
    pub fn set_sampling_client(&self, client: Arc<dyn SamplingClient>) {
        if let Ok(mut guard) = self.inner.sampling.write() {
            *guard = Some(client);
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.tz
    }

    /// Hydrate every persisted task, normalize it, and arm its timer.
    pub async fn initialize(&self) -> Result<usize, SchedulerError> {
        let tasks = self.inner.store.list().await?;
        let count = tasks.len();
        let now = time::now();

        for mut task in tasks {
            normalize(&self.inner, &mut task, now);
            self.inner.store.upsert(&task).await?;
            if task.enabled && task.status != TaskStatus::Completed {
                arm(&self.inner, &task).await;
            }
        }

        info!(count = count, tz = %self.inner.tz, "scheduler initialized");
        Ok(count)
    }

    /// Create a task, persist it, and arm its timer.
    pub async fn create(&self, params: CreateTaskParams) -> Result<Task, SchedulerError> {
        if params.name.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "name must be a non-empty string".to_string(),
            ));
        }
        let trigger_type = TriggerType::parse(&params.trigger_type).ok_or_else(|| {
            SchedulerError::Validation(format!(
                "Invalid trigger_type '{}': expected interval, cron, or date",
                params.trigger_type
            ))
        })?;
        validate_prompt(params.agent_prompt.as_deref())?;

        let now = time::now();
        let trigger_config =
            trigger::validate_trigger(trigger_type, &params.trigger_config, now, self.inner.tz)?;
        let next_run =
            trigger::next_fire(trigger_type, &trigger_config, now, self.inner.tz, None)?;

        let task = Task {
            id: generate_task_id(now),
            name: Some(params.name.clone()),
            trigger_type,
            trigger_config,
            mcp_server: params.mcp_server,
            mcp_tool: params.mcp_tool,
            mcp_arguments: params.mcp_arguments,
            agent_prompt: params.agent_prompt,
            enabled: true,
            status: TaskStatus::Scheduled,
            created_at: now,
            updated_at: now,
            last_run: None,
            last_status: None,
            last_message: None,
            next_run,
            history: Vec::new(),
        };

        self.inner.store.upsert(&task).await?;
        self.inner
            .names
            .lock()
            .await
            .insert(task.id.clone(), params.name);
        arm(&self.inner, &task).await;

        info!(task_id = %task.id, trigger = task.trigger_type.as_str(), "task created");
        Ok(task)
    }

    /// Merge a patch into a task, re-normalize, and re-arm its timer.
    pub async fn update(&self, params: UpdateTaskParams) -> Result<Task, SchedulerError> {
        let mut task = self.load(&params.task_id).await?;
        let now = time::now();

        match (&params.trigger_type, &params.trigger_config) {
            (Some(raw), Some(config)) => {
                let trigger_type = TriggerType::parse(raw).ok_or_else(|| {
                    SchedulerError::Validation(format!(
                        "Invalid trigger_type '{raw}': expected interval, cron, or date"
                    ))
                })?;
                task.trigger_config =
                    trigger::validate_trigger(trigger_type, config, now, self.inner.tz)?;
                task.trigger_type = trigger_type;
                task.next_run = None;
            }
            (Some(_), None) => {
                return Err(SchedulerError::Validation(
                    "trigger_config is required when changing trigger_type".to_string(),
                ));
            }
            (None, Some(config)) => {
                task.trigger_config =
                    trigger::validate_trigger(task.trigger_type, config, now, self.inner.tz)?;
                task.next_run = None;
            }
            (None, None) => {}
        }

        if let Some(name) = params.name {
            if name.trim().is_empty() {
                return Err(SchedulerError::Validation(
                    "name must be a non-empty string".to_string(),
                ));
            }
            self.inner
                .names
                .lock()
                .await
                .insert(task.id.clone(), name.clone());
            task.name = Some(name);
        }
        if let Some(prompt) = params.agent_prompt {
            validate_prompt(Some(&prompt))?;
            task.agent_prompt = Some(prompt);
        }
        if let Some(server) = params.mcp_server {
            task.mcp_server = Some(server);
        }
        if let Some(tool) = params.mcp_tool {
            task.mcp_tool = Some(tool);
        }
        if let Some(arguments) = params.mcp_arguments {
            task.mcp_arguments = Some(arguments);
        }

        task.updated_at = now;
        self.persist_and_rearm(task).await
    }

    /// Pause: disable scheduling, keeping the task and its history.
    pub async fn pause(&self, id: &str) -> Result<Task, SchedulerError> {
        self.set_enabled(id, false).await
    }

    /// Resume a paused task.
    pub async fn resume(&self, id: &str) -> Result<Task, SchedulerError> {
        self.set_enabled(id, true).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Task, SchedulerError> {
        let mut task = self.load(id).await?;
        task.enabled = enabled;
        task.updated_at = time::now();
        self.persist_and_rearm(task).await
    }

    /// Delete a task: unarm, then cascade-delete the row and its history.
    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        unarm(&self.inner, id).await;
        let existed = self.inner.store.delete(id).await?;
        self.inner.names.lock().await.remove(id);
        self.inner.fire_locks.lock().await.remove(id);
        if !existed {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Fire a task right now, regardless of its schedule. Waits for any
    /// in-flight scheduled fire of the same task; timers are unaffected.
    pub async fn execute(&self, id: &str) -> Result<FireOutcome, SchedulerError> {
        if !self.inner.store.exists(id).await? {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let lock = self.inner.fire_lock(id).await;
        let _guard = lock.lock().await;
        executor::fire_task(&self.inner, id).await
    }

    /// Drop all history rows and last-run fields.
    pub async fn clear_history(&self, id: &str) -> Result<Task, SchedulerError> {
        if !self.inner.store.clear_history(id).await? {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        self.load(id).await
    }

    /// Fetch one task (normalized view).
    pub async fn get(&self, id: &str) -> Result<Task, SchedulerError> {
        let mut task = self.load(id).await?;
        normalize(&self.inner, &mut task, time::now());
        Ok(task)
    }

    /// All tasks (normalized view), optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, SchedulerError> {
        let now = time::now();
        let names = self.inner.names.lock().await.clone();
        let mut tasks = self.inner.store.list().await?;
        for task in &mut tasks {
            task.name = names.get(&task.id).cloned();
            normalize(&self.inner, task, now);
        }
        if let Some(filter) = status {
            tasks.retain(|t| t.status == filter);
        }
        Ok(tasks)
    }

    /// Cancel every timer. In-flight fires run to completion on their own.
    pub async fn shutdown(&self) {
        let mut count = 0usize;
        for handle in self.inner.cron_timers.lock().await.drain() {
            handle.1.abort();
            count += 1;
        }
        for handle in self.inner.clock_timers.lock().await.drain() {
            handle.1.abort();
            count += 1;
        }
        info!(timers = count, "scheduler shut down");
    }

    /// Number of registered tasks, armed or not.
    pub async fn task_count(&self) -> Result<usize, SchedulerError> {
        Ok(self.inner.store.count().await?)
    }

    /// Number of currently armed timers (both registries).
    pub async fn armed_count(&self) -> usize {
        self.inner.cron_timers.lock().await.len() + self.inner.clock_timers.lock().await.len()
    }

    async fn load(&self, id: &str) -> Result<Task, SchedulerError> {
        let mut task = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        task.name = self.inner.name_of(id).await;
        Ok(task)
    }

    async fn persist_and_rearm(&self, mut task: Task) -> Result<Task, SchedulerError> {
        normalize(&self.inner, &mut task, time::now());
        self.inner.store.upsert(&task).await?;
        unarm(&self.inner, &task.id).await;
        if task.enabled && task.status != TaskStatus::Completed {
            arm(&self.inner, &task).await;
        }
        Ok(task)
    }

    // ── Describe projection ─────────────────────────────────────────

    /// Project a task into its presentation shape: `trigger_summary`,
    /// localized timestamps, and (for date triggers) a localized mirror of
    /// the trigger config.
    pub fn describe(&self, task: &Task) -> Value {
        let tz = self.inner.tz;
        let mut map = match serde_json::to_value(task) {
            Ok(Value::Object(map)) => map,
            _ => return Value::Null,
        };

        map.insert(
            "trigger_summary".to_string(),
            json!(trigger_summary(task, tz)),
        );

        let locals = [
            ("next_run_local", task.next_run),
            ("last_run_local", task.last_run),
            ("created_at_local", Some(task.created_at)),
            ("updated_at_local", Some(task.updated_at)),
        ];
        for (field, instant) in locals {
            if let Some(instant) = instant {
                map.insert(field.to_string(), json!(time::format_local(instant, tz)));
            }
        }

        if let Some(Value::Array(entries)) = map.get_mut("history") {
            for (value, entry) in entries.iter_mut().zip(&task.history) {
                if let Value::Object(entry_map) = value {
                    entry_map.insert(
                        "run_at_local".to_string(),
                        json!(time::format_local(entry.run_at, tz)),
                    );
                }
            }
        }

        if task.trigger_type == TriggerType::Date {
            if let Ok(run_date) = trigger::run_date_of(&task.trigger_config) {
                map.insert(
                    "trigger_config_local".to_string(),
                    json!({ "run_date_local": time::format_local(run_date, tz) }),
                );
            }
        }

        Value::Object(map)
    }
}

fn validate_prompt(prompt: Option<&str>) -> Result<(), SchedulerError> {
    if let Some(p) = prompt {
        if p.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "agent_prompt must be a non-empty string".to_string(),
            ));
        }
    }
    Ok(())
}

// ── Normalization ───────────────────────────────────────────────────

/// Derive `status` and `next_run` from stored fields and the current
/// instant, enforcing the task invariants. Applied before arming and on
/// every read.
pub(crate) fn normalize(inner: &SchedulerInner, task: &mut Task, now: DateTime<Utc>) {
    task.history.truncate(HISTORY_LIMIT);

    let date_finished = task.trigger_type == TriggerType::Date
        && (task
            .history
            .first()
            .map(|h| h.status == RunStatus::Success)
            .unwrap_or(false)
            || trigger::run_date_of(&task.trigger_config)
                .map(|run_date| run_date <= now)
                .unwrap_or(false));

    task.status = if !task.enabled {
        if task.status == TaskStatus::Completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Paused
        }
    } else if task.status == TaskStatus::Running {
        TaskStatus::Running
    } else if date_finished {
        TaskStatus::Completed
    } else if task.last_status == Some(RunStatus::Error) {
        TaskStatus::Error
    } else {
        TaskStatus::Scheduled
    };

    if task.trigger_type == TriggerType::Date && task.status == TaskStatus::Completed {
        task.enabled = false;
    }

    let next = if task.status == TaskStatus::Completed {
        None
    } else {
        match trigger::next_fire(
            task.trigger_type,
            &task.trigger_config,
            now,
            inner.tz,
            task.next_run,
        ) {
            Ok(next) => next,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cannot compute next fire");
                None
            }
        }
    };
    task.next_run = next;
}

// ── Timer arming ────────────────────────────────────────────────────

/// Arm the timer for a task (idempotent: always unarms first).
pub(crate) async fn arm(inner: &Arc<SchedulerInner>, task: &Task) {
    unarm(inner, &task.id).await;

    match task.trigger_type {
        TriggerType::Interval => {
            let delta_ms = match serde_json::from_value::<IntervalConfig>(
                task.trigger_config.clone(),
            )
            .map_err(|e| e.to_string())
            .and_then(|c| c.delta_ms().map_err(|e| e.to_string()))
            {
                Ok(ms) => ms,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cannot arm interval timer");
                    return;
                }
            };
            let handle = tokio::spawn(interval_loop(
                Arc::clone(inner),
                task.id.clone(),
                delta_ms,
                task.next_run,
            ));
            inner
                .clock_timers
                .lock()
                .await
                .insert(task.id.clone(), handle);
        }
        TriggerType::Cron => {
            let expression = match serde_json::from_value::<CronConfig>(task.trigger_config.clone())
            {
                Ok(config) => config.expression,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cannot arm cron timer");
                    return;
                }
            };
            let handle = tokio::spawn(cron_loop(Arc::clone(inner), task.id.clone(), expression));
            inner
                .cron_timers
                .lock()
                .await
                .insert(task.id.clone(), handle);
        }
        TriggerType::Date => {
            let run_date = match trigger::run_date_of(&task.trigger_config) {
                Ok(run_date) => run_date,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cannot arm date timer");
                    return;
                }
            };
            let handle = tokio::spawn(date_fire(Arc::clone(inner), task.id.clone(), run_date));
            inner
                .clock_timers
                .lock()
                .await
                .insert(task.id.clone(), handle);
        }
    }
    debug!(task_id = %task.id, trigger = task.trigger_type.as_str(), "timer armed");
}

/// Remove and abort any timer for this task, in both registries.
pub(crate) async fn unarm(inner: &SchedulerInner, id: &str) {
    if let Some(handle) = inner.cron_timers.lock().await.remove(id) {
        handle.abort();
        debug!(task_id = %id, "cron timer unarmed");
    }
    if let Some(handle) = inner.clock_timers.lock().await.remove(id) {
        handle.abort();
        debug!(task_id = %id, "clock timer unarmed");
    }
}

/// Interval ticker: first tick at the planned instant, then every period.
/// A tick that lands while a fire is still running is dropped, so the next
/// fire happens one period after its scheduled time, never in a burst.
async fn interval_loop(
    inner: Arc<SchedulerInner>,
    id: String,
    delta_ms: u64,
    first: Option<DateTime<Utc>>,
) {
    match first {
        Some(instant) => sleep_until(instant).await,
        None => tokio::time::sleep(Duration::from_millis(delta_ms)).await,
    }
    loop {
        spawn_fire(&inner, &id);
        tokio::time::sleep(Duration::from_millis(delta_ms)).await;
    }
}

/// Cron ticker: sleeps to each upcoming occurrence in the resolved zone.
async fn cron_loop(inner: Arc<SchedulerInner>, id: String, expression: String) {
    let schedule = match trigger::parse_cron(&expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(task_id = %id, error = %e, "invalid cron expression in armed task");
            return;
        }
    };
    loop {
        let now = time::now();
        let next = schedule
            .after(&now.with_timezone(&inner.tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc));
        let Some(next) = next else {
            debug!(task_id = %id, "cron schedule exhausted");
            break;
        };
        sleep_until(next).await;
        spawn_fire(&inner, &id);
    }
}

/// One-shot date clock: fires once, removing itself from the registry first.
async fn date_fire(inner: Arc<SchedulerInner>, id: String, run_date: DateTime<Utc>) {
    sleep_until(run_date).await;
    inner.clock_timers.lock().await.remove(&id);
    spawn_fire(&inner, &id);
}

/// Launch a scheduled fire on its own task, detached from the timer: an
/// unarm (update, pause, delete, shutdown) aborts only the timer, while a
/// fire already in flight runs to completion.
fn spawn_fire(inner: &Arc<SchedulerInner>, id: &str) {
    let inner = Arc::clone(inner);
    let id = id.to_string();
    tokio::spawn(async move {
        let lock = inner.fire_lock(&id).await;
        let try_result = lock.try_lock();
        match try_result {
            Ok(_guard) => {
                if let Err(e) = executor::fire_task(&inner, &id).await {
                    warn!(task_id = %id, error = %e, "scheduled fire failed to run");
                }
            }
            Err(_) => {
                debug!(task_id = %id, "fire already in progress, tick coalesced");
            }
        }
    });
}

async fn sleep_until(instant: DateTime<Utc>) {
    let now = time::now();
    if instant > now {
        if let Ok(duration) = (instant - now).to_std() {
            tokio::time::sleep(duration).await;
        }
    }
}

// ── Trigger summary ─────────────────────────────────────────────────

/// Human-facing one-line summary of a trigger, localized the way the
/// presentation layer has always shown it (e.g. `每30分钟`,
/// `Cron: 0 9 * * *`, `一次性 @ 2025-10-09 14:00:00`).
fn trigger_summary(task: &Task, tz: Tz) -> String {
    match task.trigger_type {
        TriggerType::Interval => {
            match serde_json::from_value::<IntervalConfig>(task.trigger_config.clone())
                .map_err(|e| e.to_string())
                .and_then(|c| c.delta_ms().map_err(|e| e.to_string()))
            {
                Ok(delta_ms) => format!("每{}", describe_period(delta_ms)),
                Err(_) => "每?".to_string(),
            }
        }
        TriggerType::Cron => {
            let expression = task
                .trigger_config
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or("?");
            format!("Cron: {expression}")
        }
        TriggerType::Date => match trigger::run_date_of(&task.trigger_config) {
            Ok(run_date) => format!("一次性 @ {}", time::format_local(run_date, tz)),
            Err(_) => "一次性 @ ?".to_string(),
        },
    }
}

/// Decompose a millisecond period into `天/小时/分钟/秒` parts.
fn describe_period(delta_ms: u64) -> String {
    let millis = delta_ms % 1_000;
    let mut secs = delta_ms / 1_000;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut parts = String::new();
    if days > 0 {
        parts.push_str(&format!("{days}天"));
    }
    if hours > 0 {
        parts.push_str(&format!("{hours}小时"));
    }
    if minutes > 0 {
        parts.push_str(&format!("{minutes}分钟"));
    }
    if secs > 0 {
        parts.push_str(&format!("{secs}秒"));
    }
    if millis > 0 || parts.is_empty() {
        parts.push_str(&format!("{millis}毫秒"));
    }
    parts
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_period_single_unit() {
        assert_eq!(describe_period(30 * 60 * 1_000), "30分钟");
        assert_eq!(describe_period(1_000), "1秒");
        assert_eq!(describe_period(86_400_000), "1天");
    }

    #[test]
    fn test_describe_period_combined() {
        assert_eq!(describe_period(5_400_000), "1小时30分钟");
        assert_eq!(describe_period(90_061_000), "1天1小时1分钟1秒");
    }

    #[test]
    fn test_describe_period_sub_second() {
        assert_eq!(describe_period(500), "500毫秒");
        assert_eq!(describe_period(1_500), "1秒500毫秒");
    }
}
