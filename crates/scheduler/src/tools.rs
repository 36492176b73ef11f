//! The MCP tool surface: catalogue, argument validation, and dispatch.
//!
//! Every tool returns a single text content block holding a JSON document
//! (two-space indent). Successes carry `{"success": true, ...}`; failures
//! carry `{"success": false, "error": ..., "stack"?: ...}` and are marked
//! as errors at the RPC layer.

use async_trait::async_trait;
use metronome_core::time;
use metronome_mcp::{
    CallToolParams, CallToolResult, InitializeResult, ListToolsResult, McpError, RequestHandler,
    ServerCapabilities, ServerInfo, ToolInfo, PROTOCOL_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::{CreateTaskParams, TaskStatus, UpdateTaskParams};

/// Routes the inbound MCP surface (initialize, tools/list, tools/call)
/// into the scheduler.
pub struct ToolRouter {
    scheduler: Scheduler,
    server_name: String,
}

impl ToolRouter {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            server_name: "metronome".to_string(),
        }
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> CallToolResult {
        debug!(tool = %name, "dispatching tool call");
        match self.call_tool(name, arguments).await {
            Ok(payload) => match serde_json::to_string_pretty(&payload) {
                Ok(text) => CallToolResult::text(text, false),
                Err(e) => error_result(&SchedulerError::Validation(e.to_string())),
            },
            Err(e) => error_result(&e),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, SchedulerError> {
        match name {
            "create_task" => {
                let params: CreateTaskParams = parse_args(arguments)?;
                let task = self.scheduler.create(params).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "list_tasks" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(default)]
                    status: Option<String>,
                }
                let args: Args = parse_args(arguments)?;
                let filter = match args.status.as_deref() {
                    Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
                        SchedulerError::Validation(format!("Invalid status filter '{raw}'"))
                    })?),
                    None => None,
                };
                let tasks = self.scheduler.list(filter).await?;
                let described: Vec<Value> =
                    tasks.iter().map(|t| self.scheduler.describe(t)).collect();
                Ok(json!({ "success": true, "count": described.len(), "tasks": described }))
            }
            "get_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.get(&args.task_id).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "update_task" => {
                let params: UpdateTaskParams = parse_args(arguments)?;
                let task = self.scheduler.update(params).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "delete_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                self.scheduler.delete(&args.task_id).await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Task {} deleted", args.task_id),
                }))
            }
            "pause_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.pause(&args.task_id).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "resume_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.resume(&args.task_id).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "execute_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let outcome = self.scheduler.execute(&args.task_id).await?;
                Ok(json!({ "success": outcome.success, "message": outcome.message }))
            }
            "clear_task_history" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.clear_history(&args.task_id).await?;
                Ok(json!({ "success": true, "task": self.scheduler.describe(&task) }))
            }
            "get_current_time" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(default)]
                    format: Option<String>,
                }
                let args: Args = parse_args(arguments)?;
                let tz = self.scheduler.timezone();
                let now = time::now();
                let format = args.format.as_deref().unwrap_or("iso");
                let rendered = match format {
                    "iso" => now.with_timezone(&tz).to_rfc3339(),
                    "readable" => time::format_local(now, tz),
                    other => {
                        return Err(SchedulerError::Validation(format!(
                            "Invalid format '{other}': expected iso or readable"
                        )))
                    }
                };
                Ok(json!({
                    "success": true,
                    "time": rendered,
                    "timezone": tz.name(),
                    "format": format,
                }))
            }
            other => Err(SchedulerError::Validation(format!("Unknown tool: {other}"))),
        }
    }
}

#[derive(Deserialize)]
struct TaskIdArgs {
    task_id: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, SchedulerError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| SchedulerError::Validation(format!("Invalid arguments: {e}")))
}

/// Shape an error into the standard envelope, marked as an error at the
/// RPC layer. The `stack` field is present only when the error has an
/// underlying source.
fn error_result(error: &SchedulerError) -> CallToolResult {
    let mut envelope = json!({ "success": false, "error": error.to_string() });
    if let Some(source) = std::error::Error::source(error) {
        envelope["stack"] = json!(source.to_string());
    }
    let text = serde_json::to_string_pretty(&envelope)
        .unwrap_or_else(|_| r#"{"success":false,"error":"internal error"}"#.to_string());
    CallToolResult::text(text, true)
}

#[async_trait]
impl RequestHandler for ToolRouter {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        match method {
            "initialize" => {
                info!("client initializing");
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities::tools_and_sampling(),
                    server_info: ServerInfo {
                        name: self.server_name.clone(),
                        version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    },
                };
                Ok(serde_json::to_value(result)?)
            }
            "tools/list" => Ok(serde_json::to_value(ListToolsResult { tools: catalogue() })?),
            "tools/call" => {
                let params = params
                    .ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
                let call: CallToolParams = serde_json::from_value(params)
                    .map_err(|e| McpError::InvalidParams(e.to_string()))?;
                let result = self.dispatch(&call.name, call.arguments).await;
                Ok(serde_json::to_value(result)?)
            }
            other => Err(McpError::MethodNotFound(other.to_string())),
        }
    }

    async fn handle_notification(&self, method: &str, _params: Option<Value>) {
        match method {
            "notifications/initialized" => info!("client confirmed initialization"),
            other => debug!(method = %other, "ignoring notification"),
        }
    }
}

// ── Catalogue ───────────────────────────────────────────────────────

fn schema_task_id() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": { "type": "string", "description": "Task identifier" }
        },
        "required": ["task_id"]
    })
}

/// The fixed tool catalogue.
pub fn catalogue() -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: "create_task".to_string(),
            description: "Create a scheduled task with an interval, cron, or one-shot date \
                          trigger. An agent_prompt makes each fire ask the client to execute \
                          the instruction via sampling."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Display name" },
                    "trigger_type": { "type": "string", "enum": ["interval", "cron", "date"] },
                    "trigger_config": {
                        "type": "object",
                        "description": "interval: {seconds|minutes|hours|days}; \
                                        cron: {expression} (5-field); \
                                        date: {run_date} and/or {delay_seconds|delay_minutes|delay_hours|delay_days}"
                    },
                    "agent_prompt": { "type": "string", "description": "Instruction executed by the client on each fire" },
                    "mcp_server": { "type": "string", "description": "Legacy field, retained but not invoked" },
                    "mcp_tool": { "type": "string", "description": "Legacy field, retained but not invoked" },
                    "mcp_arguments": { "type": "object", "description": "Legacy field, retained but not invoked" }
                },
                "required": ["name", "trigger_type", "trigger_config"]
            }),
        },
        ToolInfo {
            name: "list_tasks".to_string(),
            description: "List all tasks, optionally filtered by status.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["scheduled", "running", "paused", "completed", "error"]
                    }
                }
            }),
        },
        ToolInfo {
            name: "get_task".to_string(),
            description: "Get one task by id.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "update_task".to_string(),
            description: "Update a task. Changing trigger_type requires trigger_config."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "name": { "type": "string" },
                    "trigger_type": { "type": "string", "enum": ["interval", "cron", "date"] },
                    "trigger_config": { "type": "object" },
                    "agent_prompt": { "type": "string" },
                    "mcp_server": { "type": "string" },
                    "mcp_tool": { "type": "string" },
                    "mcp_arguments": { "type": "object" }
                },
                "required": ["task_id"]
            }),
        },
        ToolInfo {
            name: "delete_task".to_string(),
            description: "Delete a task and its history.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "pause_task".to_string(),
            description: "Disable a task's scheduling without deleting it.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "resume_task".to_string(),
            description: "Re-enable a paused task.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "execute_task".to_string(),
            description: "Run a task immediately, regardless of its schedule.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "clear_task_history".to_string(),
            description: "Remove a task's run history and last-run fields.".to_string(),
            input_schema: schema_task_id(),
        },
        ToolInfo {
            name: "get_current_time".to_string(),
            description: "The server's current time in its configured timezone.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["iso", "readable"] }
                }
            }),
        },
    ]
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_names_are_unique_and_complete() {
        let tools = catalogue();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in [
            "create_task",
            "list_tasks",
            "get_task",
            "update_task",
            "delete_task",
            "pause_task",
            "resume_task",
            "execute_task",
            "clear_task_history",
            "get_current_time",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
    }

    #[test]
    fn test_error_result_shape() {
        let result = error_result(&SchedulerError::NotFound("task-1".to_string()));
        assert!(result.is_error);
        let text = match &result.content[0] {
            metronome_mcp::ToolContent::Text { text } => text,
        };
        let envelope: Value = serde_json::from_str(text).unwrap();
        assert_eq!(envelope["success"], json!(false));
        assert_eq!(envelope["error"], json!("Task not found: task-1"));
        assert!(envelope.get("stack").is_none());
    }

    #[test]
    fn test_parse_args_null_becomes_empty_object() {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            status: Option<String>,
        }
        let args: Args = parse_args(Value::Null).unwrap();
        assert!(args.status.is_none());
    }
}
