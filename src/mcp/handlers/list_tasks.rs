use std::fmt::Write;

use serde_json::Value;

use super::{arg_i64, arg_str};
use crate::error::Error;
use crate::tasks::{Filter, Status};
use crate::AppContext;

/// List tasks with optional status/project filters.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let mut filter = Filter::default();
    let status = arg_str(args, "status");
    if !status.is_empty() {
        filter.status = status;
    }
    filter.project = arg_str(args, "project");
    let limit = arg_i64(args, "limit");
    if limit > 0 {
        filter.limit = limit as usize;
    }

    let tasks = ctx.tasks.list(&filter);
    if tasks.is_empty() {
        return Ok("No tasks found matching the given filters.".to_string());
    }

    let mut b = String::new();
    let _ = writeln!(b, "📋 Tasks ({} found)\n", tasks.len());

    for t in tasks {
        let _ = writeln!(b, "{} **{}** — {}", status_icon(t.status), t.id, t.status);
        let _ = writeln!(b, "  Project: {} | Priority: {}", t.project, t.priority);

        if t.status == Status::Running {
            let _ = write!(b, "  Duration: {}", t.format_duration());
            if !t.progress.is_empty() {
                let _ = write!(b, " | Progress: {}", t.progress);
            }
            b.push('\n');
        }
        if matches!(t.status, Status::Completed | Status::Failed) {
            let _ = writeln!(
                b,
                "  Duration: {} | Cost: ${:.2}",
                t.format_duration(),
                t.cost_usd
            );
        }
        if t.status == Status::Linked && !t.current_task.is_empty() {
            let _ = writeln!(b, "  Current: {}", t.current_task);
        }
        if !t.error.is_empty() {
            let _ = writeln!(b, "  Error: {}", t.error);
        }
        b.push('\n');
    }

    Ok(b)
}

pub(crate) fn status_icon(status: Status) -> &'static str {
    match status {
        Status::Pending => "⏳",
        Status::Queued => "📥",
        Status::Running => "🔄",
        Status::Completed => "✅",
        Status::Failed => "❌",
        Status::Cancelled => "🚫",
        Status::Linked => "🔗",
    }
}
