//! Per-task prompt files.
//!
//! Prompts are piped to the agent CLI via stdin from a file, which avoids
//! CLI argument length limits (~7000 bytes).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Write the prompt to `<work_dir>/tasks/<task_id>/prompt.md` (directory
/// 0750, file 0640) and return its path.
pub fn write_prompt_file(work_dir: &Path, task_id: &str, prompt: &str) -> Result<PathBuf> {
    let dir = task_dir(work_dir, task_id);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&dir)
            .context("creating prompt directory")?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(&dir).context("creating prompt directory")?;

    let path = dir.join("prompt.md");
    std::fs::write(&path, prompt).context("writing prompt file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640))
            .context("setting prompt file mode")?;
    }

    Ok(path)
}

fn task_dir(work_dir: &Path, task_id: &str) -> PathBuf {
    work_dir.join("tasks").join(task_id)
}

/// Removes the task's prompt directory when dropped, on every exit path of
/// the driver.
pub struct PromptDirGuard {
    dir: PathBuf,
}

impl PromptDirGuard {
    pub fn new(work_dir: &Path, task_id: &str) -> Self {
        Self {
            dir: task_dir(work_dir, task_id),
        }
    }
}

impl Drop for PromptDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), err = %e, "prompt cleanup failed");
            }
        }
    }
}
