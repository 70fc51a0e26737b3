//! MCP tool handlers.
//!
//! Each tool takes the shared [`AppContext`] plus the raw JSON arguments
//! and returns human-readable text. Failures become structured MCP error
//! results at the dispatch layer, never transport errors.

pub mod cancel_task;
pub mod check_task;
pub mod get_diff;
pub mod get_logs;
pub mod herald_push;
pub mod list_projects;
pub mod list_tasks;
pub mod read_file;
pub mod start_task;

use serde_json::{json, Value};

use super::protocol::{tool_error, tool_text};
use crate::AppContext;

/// Route a `tools/call` to its handler.
pub async fn dispatch_tool(
    ctx: &AppContext,
    name: &str,
    args: &Value,
    mcp_session_id: &str,
) -> Value {
    let result = match name {
        "list_projects" => list_projects::handle(ctx, args).await,
        "list_tasks" => list_tasks::handle(ctx, args).await,
        "check_task" => check_task::handle(ctx, args).await,
        "get_logs" => get_logs::handle(ctx, args).await,
        "get_diff" => get_diff::handle(ctx, args).await,
        "cancel_task" => cancel_task::handle(ctx, args).await,
        "read_file" => read_file::handle(ctx, args).await,
        "herald_push" => herald_push::handle(ctx, args).await,
        "start_task" => start_task::handle(ctx, args, mcp_session_id).await,
        other => return tool_error(format!("Unknown tool: {other}")),
    };

    match result {
        Ok(text) => tool_text(text),
        Err(e) => tool_error(e.to_string()),
    }
}

/// Tool descriptors for `tools/list`.
pub fn definitions() -> Vec<Value> {
    vec![
        tool(
            "list_projects",
            "List configured projects with their git state",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "list_tasks",
            "List tasks, optionally filtered by status or project",
            json!({"type": "object", "properties": {
                "status": {"type": "string", "description": "all, pending, queued, running, completed, failed, cancelled, or linked"},
                "project": {"type": "string"},
                "limit": {"type": "number"}
            }}),
        ),
        tool(
            "check_task",
            "Check the status of a task",
            json!({"type": "object", "properties": {
                "task_id": {"type": "string"},
                "include_output": {"type": "boolean"},
                "output_lines": {"type": "number"}
            }, "required": ["task_id"]}),
        ),
        tool(
            "get_logs",
            "Show a task's event log, or recent activity across tasks",
            json!({"type": "object", "properties": {
                "task_id": {"type": "string"},
                "limit": {"type": "number"}
            }}),
        ),
        tool(
            "get_diff",
            "Show the git diff for a task or project",
            json!({"type": "object", "properties": {
                "task_id": {"type": "string"},
                "project": {"type": "string"}
            }}),
        ),
        tool(
            "cancel_task",
            "Cancel a running or queued task",
            json!({"type": "object", "properties": {
                "task_id": {"type": "string"}
            }, "required": ["task_id"]}),
        ),
        tool(
            "read_file",
            "Read a file from a project directory",
            json!({"type": "object", "properties": {
                "path": {"type": "string"},
                "project": {"type": "string"}
            }, "required": ["path"]}),
        ),
        tool(
            "herald_push",
            "Register or update an externally-run agent session as a linked task",
            json!({"type": "object", "properties": {
                "session_id": {"type": "string"},
                "summary": {"type": "string"},
                "project": {"type": "string"},
                "current_task": {"type": "string"},
                "git_branch": {"type": "string"},
                "turns": {"type": "number"},
                "files_modified": {"type": "array", "items": {"type": "string"}}
            }, "required": ["session_id", "summary"]}),
        ),
        tool(
            "start_task",
            "Create and dispatch an agent task against a project",
            json!({"type": "object", "properties": {
                "project": {"type": "string"},
                "prompt": {"type": "string"},
                "session_id": {"type": "string", "description": "Resume this agent conversation"},
                "model": {"type": "string"},
                "priority": {"type": "string", "description": "low, normal, or high"},
                "allowed_tools": {"type": "array", "items": {"type": "string"}},
                "timeout_minutes": {"type": "number"},
                "dry_run": {"type": "boolean"}
            }, "required": ["project", "prompt"]}),
        ),
    ]
}

fn tool(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

// ─── Argument helpers ────────────────────────────────────────────────────────

pub(crate) fn arg_str(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn arg_i64(args: &Value, key: &str) -> i64 {
    args.get(key).and_then(Value::as_i64).unwrap_or(0)
}

pub(crate) fn arg_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn arg_str_vec(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
