use std::fmt::Write;

use serde_json::Value;

use crate::error::Error;
use crate::AppContext;

/// List all configured projects with their git state.
pub async fn handle(ctx: &AppContext, _args: &Value) -> Result<String, Error> {
    let projects = ctx.projects.all();
    if projects.is_empty() {
        return Ok(
            "No projects configured. Add projects to your herald.yaml configuration.".to_string(),
        );
    }

    let mut b = String::new();
    let _ = writeln!(b, "**{} project(s) configured**\n", projects.len());

    for p in projects {
        let default_mark = if p.default { " (default)" } else { "" };
        let git_state = crate::git::state_line(&p.path)
            .map(|s| format!(" | git: {s}"))
            .unwrap_or_default();

        let _ = writeln!(b, "**{}**{}", p.name, default_mark);
        if !p.description.is_empty() {
            let _ = writeln!(b, "  {}", p.description);
        }
        let _ = writeln!(b, "  Path: {}{}", p.path.display(), git_state);
        let _ = writeln!(b, "  Concurrency: {} task(s)", p.max_concurrent_tasks);
        if !p.allowed_tools.is_empty() {
            let _ = writeln!(b, "  Tools: {}", p.allowed_tools.join(", "));
        }
        b.push('\n');
    }

    Ok(b)
}
