use std::fmt::Write;

use serde_json::Value;

use super::list_tasks::status_icon;
use super::{arg_i64, arg_str};
use crate::error::Error;
use crate::tasks::Filter;
use crate::AppContext;

/// Show one task's event log, or recent activity across all tasks.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let task_id = arg_str(args, "task_id");
    let limit = match arg_i64(args, "limit") {
        n if n > 0 => n,
        _ => 20,
    };

    if task_id.is_empty() {
        return recent_activity(ctx, limit);
    }
    task_logs(ctx, &task_id, limit).await
}

async fn task_logs(ctx: &AppContext, task_id: &str, limit: i64) -> Result<String, Error> {
    let snap = ctx.tasks.get(task_id)?;

    let mut b = String::new();
    let _ = writeln!(b, "📋 Logs for task {task_id}\n");
    let _ = writeln!(b, "Status: {} {}", status_icon(snap.status), snap.status);
    let _ = writeln!(b, "Project: {}", snap.project);
    let _ = writeln!(b, "Created: {}", snap.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(t) = snap.started_at {
        let _ = writeln!(b, "Started: {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = snap.completed_at {
        let _ = writeln!(b, "Completed: {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    let _ = writeln!(b, "Duration: {}", snap.format_duration());
    if !snap.session_id.is_empty() {
        let _ = writeln!(b, "Session: {}", snap.session_id);
    }
    if snap.cost_usd > 0.0 {
        let _ = writeln!(b, "Cost: ${:.4}", snap.cost_usd);
    }
    if snap.turns > 0 {
        let _ = writeln!(b, "Turns: {}", snap.turns);
    }
    if !snap.error.is_empty() {
        let _ = writeln!(b, "\nError: {}", snap.error);
    }
    if !snap.progress.is_empty() {
        let _ = writeln!(b, "\nLast progress: {}", snap.progress);
    }

    // The persisted event trail, newest first.
    if let Some(store) = &ctx.store {
        if let Ok(events) = store.list_task_events(task_id, limit).await {
            if !events.is_empty() {
                let _ = writeln!(b, "\n--- Events ---");
                for e in events {
                    let _ = writeln!(b, "{} {} {}", e.created_at, e.event_type, e.message);
                }
            }
        }
    }

    Ok(b)
}

fn recent_activity(ctx: &AppContext, limit: i64) -> Result<String, Error> {
    let tasks = ctx.tasks.list(&Filter {
        status: "all".to_string(),
        project: String::new(),
        limit: limit as usize,
    });
    if tasks.is_empty() {
        return Ok("No activity recorded yet.".to_string());
    }

    let mut b = String::new();
    let _ = writeln!(b, "📋 Recent activity ({} tasks)\n", tasks.len());
    for t in tasks {
        let _ = writeln!(
            b,
            "{} {} — {} ({}) — {}",
            status_icon(t.status),
            t.id,
            t.status,
            t.project,
            t.created_at.format("%H:%M:%S")
        );
    }
    Ok(b)
}
