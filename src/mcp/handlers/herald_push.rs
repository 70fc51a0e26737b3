use std::fmt::Write;

use serde_json::Value;

use super::{arg_i64, arg_str, arg_str_vec};
use crate::error::Error;
use crate::tasks::{Status, Task};
use crate::AppContext;

/// Register an externally-run agent session as a linked task. A second
/// push with the same session id updates the existing task in place.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let session_id = arg_str(args, "session_id");
    if session_id.is_empty() {
        return Err(Error::invalid("session_id is required"));
    }
    let summary = arg_str(args, "summary");
    if summary.is_empty() {
        return Err(Error::invalid("summary is required"));
    }

    let project = arg_str(args, "project");
    let current_task = arg_str(args, "current_task");
    let git_branch = arg_str(args, "git_branch");
    let turns = arg_i64(args, "turns");
    let files_modified = arg_str_vec(args, "files_modified");

    // Same session id: update in place rather than duplicating.
    if let Some(existing) = ctx.tasks.get_by_session(&session_id, Status::Linked) {
        ctx.tasks.set_output(&existing.id, &summary)?;
        ctx.tasks.set_linked_fields(
            &existing.id,
            &project,
            &git_branch,
            &current_task,
            turns,
            files_modified,
        )?;
        return Ok(response(&existing.id, &session_id, &project, true));
    }

    let task = ctx.tasks.register(Task::new_linked(
        &session_id,
        &project,
        &summary,
        &current_task,
        &git_branch,
        turns,
        files_modified,
    ))?;

    Ok(response(&task.id, &session_id, &project, false))
}

fn response(task_id: &str, session_id: &str, project: &str, updated: bool) -> String {
    let mut b = String::new();
    if updated {
        b.push_str("Session updated in Herald\n\n");
    } else {
        b.push_str("Session pushed to Herald\n\n");
    }
    let _ = writeln!(b, "- Task ID: {task_id}");
    let _ = writeln!(b, "- Session: {session_id}");
    if !project.is_empty() {
        let _ = writeln!(b, "- Project: {project}");
    }
    b.push_str("- Status: linked\n\n");
    b.push_str("You can now continue this session from another client:\n");
    b.push_str("  list_tasks to find it\n");
    b.push_str("  check_task for the full summary\n");
    let _ = write!(
        b,
        "  start_task with session_id {session_id:?} to resume"
    );
    b
}
