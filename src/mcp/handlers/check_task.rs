use std::fmt::Write;

use serde_json::Value;

use super::{arg_bool, arg_i64, arg_str};
use crate::error::Error;
use crate::tasks::Status;
use crate::AppContext;

/// Report a task's current status plus, optionally, its last output lines.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let task_id = arg_str(args, "task_id");
    if task_id.is_empty() {
        return Err(Error::invalid("task_id is required"));
    }

    let snap = ctx.tasks.get(&task_id)?;
    let include_output = arg_bool(args, "include_output");
    let output_lines = match arg_i64(args, "output_lines") {
        n if n > 0 => n as usize,
        _ => 20,
    };

    let mut b = String::new();
    match snap.status {
        Status::Pending | Status::Queued => {
            let _ = writeln!(b, "Status: {}", snap.status);
        }
        Status::Running => {
            let _ = writeln!(b, "Status: running");
            let _ = writeln!(b, "Duration: {}", snap.format_duration());
            if !snap.progress.is_empty() {
                let _ = writeln!(b, "Progress: {}", snap.progress);
            }
            if snap.cost_usd > 0.0 {
                let _ = writeln!(b, "Cost so far: ~${:.2}", snap.cost_usd);
            }
        }
        Status::Completed => {
            let _ = writeln!(b, "Status: completed");
            let _ = writeln!(b, "Duration: {}", snap.format_duration());
            if snap.cost_usd > 0.0 {
                let _ = writeln!(b, "Cost: ${:.2}", snap.cost_usd);
            }
            if snap.turns > 0 {
                let _ = writeln!(b, "Turns: {}", snap.turns);
            }
            if !snap.session_id.is_empty() {
                let _ = writeln!(
                    b,
                    "Session ID: {} (use to continue this conversation)",
                    snap.session_id
                );
            }
            b.push_str("\nUse get_diff to review the changes.");
        }
        Status::Failed => {
            let _ = writeln!(b, "Status: failed");
            let _ = writeln!(b, "Duration: {}", snap.format_duration());
            if !snap.error.is_empty() {
                let _ = writeln!(b, "Error: {}", snap.error);
            }
        }
        Status::Cancelled => {
            let _ = writeln!(b, "Status: cancelled");
            let _ = writeln!(b, "Duration: {}", snap.format_duration());
        }
        Status::Linked => {
            let _ = writeln!(b, "Status: linked (externally-run session)");
            let _ = writeln!(b, "Session ID: {}", snap.session_id);
            if !snap.current_task.is_empty() {
                let _ = writeln!(b, "Current task: {}", snap.current_task);
            }
            if !snap.files_modified.is_empty() {
                let _ = writeln!(b, "Files modified: {}", snap.files_modified.join(", "));
            }
        }
    }

    if include_output && !snap.output.is_empty() {
        let _ = write!(
            b,
            "\n--- Last output ---\n{}",
            last_n_lines(&snap.output, output_lines)
        );
    }

    Ok(b)
}

fn last_n_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.split('\n').collect();
    if lines.len() <= n {
        return s.to_string();
    }
    lines[lines.len() - n..].join("\n")
}
