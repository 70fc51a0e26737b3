use std::fmt::Write;

use serde_json::Value;

use super::arg_str;
use crate::error::Error;
use crate::AppContext;

/// Show the git diff for a task (vs its branch) or a project (vs HEAD).
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let task_id = arg_str(args, "task_id");
    let project_name = arg_str(args, "project");

    let (project, task_branch, label) = if !task_id.is_empty() {
        let snap = ctx.tasks.get(&task_id)?;
        let project = ctx.projects.get(&snap.project)?;
        (project, snap.git_branch, format!("task {task_id}"))
    } else if !project_name.is_empty() {
        let project = ctx.projects.resolve(&project_name)?;
        (project, String::new(), format!("project {}", project.name))
    } else {
        return Err(Error::invalid("task_id or project is required"));
    };

    let git = project.git();
    if !git.is_repo() {
        return Err(Error::invalid(format!(
            "Project {:?} is not a git repository",
            project.name
        )));
    }
    if !git.has_commits() {
        return Ok(format!(
            "No changes detected for {label} (repository has no commits yet)."
        ));
    }

    let diff = if !task_branch.is_empty() {
        let current = git.current_branch().ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("cannot resolve current branch"))
        })?;
        git.diff_range(&current, &task_branch)
    } else {
        git.diff_head()
    }
    .map_err(Error::Internal)?;

    if diff.trim().is_empty() {
        return Ok(format!("No changes detected for {label}."));
    }

    let mut b = String::new();
    let _ = writeln!(b, "Diff for {label}\n");
    b.push_str("```diff\n");
    b.push_str(&diff);
    b.push_str("\n```\n");
    Ok(b)
}
