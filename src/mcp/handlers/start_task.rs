use std::fmt::Write;

use serde_json::Value;

use super::{arg_bool, arg_i64, arg_str, arg_str_vec};
use crate::error::Error;
use crate::executor::claude::stream::truncate;
use crate::tasks::{Priority, Task};
use crate::AppContext;

/// Create and dispatch a task against a configured project.
pub async fn handle(ctx: &AppContext, args: &Value, mcp_session_id: &str) -> Result<String, Error> {
    let prompt = arg_str(args, "prompt");
    if prompt.is_empty() {
        return Err(Error::invalid("prompt is required"));
    }
    let project = ctx.projects.resolve(&arg_str(args, "project"))?;

    let priority: Priority = arg_str(args, "priority")
        .parse()
        .map_err(Error::InvalidArgument)?;

    let mut task = Task::new_dispatched(&project.name, &prompt, priority);
    task.session_id = arg_str(args, "session_id");
    task.model = arg_str(args, "model");
    task.dry_run = arg_bool(args, "dry_run");
    task.context = truncate(&prompt, 100);
    task.mcp_session_id = mcp_session_id.to_string();

    let timeout_minutes = arg_i64(args, "timeout_minutes");
    task.timeout = if timeout_minutes > 0 {
        std::time::Duration::from_secs(timeout_minutes as u64 * 60)
    } else {
        ctx.config.execution.default_timeout
    };

    // Explicit tool list wins; otherwise the project's configured set.
    let allowed_tools = arg_str_vec(args, "allowed_tools");
    task.allowed_tools = if allowed_tools.is_empty() {
        project.allowed_tools.clone()
    } else {
        allowed_tools
    };

    let task = ctx.tasks.register(task)?;
    ctx.tasks.dispatch(&task.id)?;

    let mut b = String::new();
    if task.dry_run {
        b.push_str("Task dispatched (dry run)\n\n");
    } else {
        b.push_str("Task dispatched\n\n");
    }
    let _ = writeln!(b, "- Task ID: {}", task.id);
    let _ = writeln!(b, "- Project: {}", task.project);
    let _ = writeln!(b, "- Priority: {}", task.priority);
    if !task.session_id.is_empty() {
        let _ = writeln!(b, "- Resuming session: {}", task.session_id);
    }
    let _ = writeln!(b, "- Timeout: {}m", task.timeout.as_secs() / 60);
    b.push_str("\nUse check_task to follow progress, cancel_task to stop it.");
    Ok(b)
}
