use std::fmt::Write;

use serde_json::Value;

use super::arg_str;
use crate::error::Error;
use crate::security::safe_path;
use crate::AppContext;

/// Files above this size are refused.
const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Read a file from a project, with path-traversal prevention and a 1 MiB
/// size cap.
pub async fn handle(ctx: &AppContext, args: &Value) -> Result<String, Error> {
    let file_path = arg_str(args, "path");
    if file_path.is_empty() {
        return Err(Error::invalid("path is required"));
    }
    let project = ctx.projects.resolve(&arg_str(args, "project"))?;

    let resolved = safe_path(&project.path, &file_path)?;

    let meta = match tokio::fs::metadata(&resolved).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!("File not found: {file_path}")));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        return Err(Error::invalid(format!(
            "{file_path} is a directory, not a file"
        )));
    }
    if meta.len() > MAX_FILE_SIZE {
        return Err(Error::invalid(format!(
            "File too large ({} bytes, max {MAX_FILE_SIZE})",
            meta.len()
        )));
    }

    let content = tokio::fs::read(&resolved).await?;
    let mut b = String::new();
    let _ = writeln!(b, "📄 {} ({} bytes)\n", file_path, content.len());
    b.push_str("```\n");
    b.push_str(&String::from_utf8_lossy(&content));
    b.push_str("\n```\n");
    Ok(b)
}
