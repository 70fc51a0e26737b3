use serde_json::Value;

use super::arg_str;
use crate::error::Error;
use crate::AppContext;

/// Cancel a running or queued task.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let task_id = arg_str(args, "task_id");
    if task_id.is_empty() {
        return Err(Error::invalid("task_id is required"));
    }

    ctx.tasks.cancel(&task_id)?;
    Ok(format!("🚫 Task {task_id} has been cancelled."))
}
