//! Driver for the Claude Code CLI.
//!
//! Spawns `claude -p --verbose --output-format stream-json` in its own
//! process group, feeds the prompt through stdin, parses the stream-json
//! stdout, and reaps the child on every path.

pub mod stream;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{
    kill, prompt, CancelHandle, ExecError, ExecResult, Executor, ProgressFn, Request, Settings,
};
use stream::{extract_output, extract_progress, parse_stream_line, truncate, StreamEvent};

/// Hard cap on a single stream-json line.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
/// Stderr is truncated to this much for logs and failure reports.
const STDERR_SNIPPET_BYTES: usize = 500;

pub struct ClaudeExecutor {
    claude_path: String,
    work_dir: std::path::PathBuf,
    env: std::collections::HashMap<String, String>,
}

pub fn factory(settings: &Settings) -> anyhow::Result<Arc<dyn Executor>> {
    let claude_path = if settings.claude_path.is_empty() {
        "claude".to_string()
    } else {
        settings.claude_path.clone()
    };
    Ok(Arc::new(ClaudeExecutor {
        claude_path,
        work_dir: settings.work_dir.clone(),
        env: settings.env.clone(),
    }))
}

impl ClaudeExecutor {
    fn build_args(&self, req: &Request) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if !req.model.is_empty() {
            args.push("--model".to_string());
            args.push(req.model.clone());
        }
        if !req.session_id.is_empty() {
            args.push("--resume".to_string());
            args.push(req.session_id.clone());
        }
        for tool in &req.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tool.clone());
        }
        args
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(
        &self,
        req: Request,
        cancel: CancelHandle,
        on_progress: ProgressFn,
    ) -> Result<ExecResult, ExecError> {
        let args = self.build_args(&req);

        if req.dry_run {
            return Ok(ExecResult {
                output: format!(
                    "[dry-run] would execute: {} {} (cwd: {})",
                    self.claude_path,
                    args.join(" "),
                    req.project_path
                ),
                ..Default::default()
            });
        }

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled {
                result: Box::new(ExecResult::default()),
            });
        }

        let prompt_path = prompt::write_prompt_file(&self.work_dir, &req.task_id, &req.prompt)?;
        let _cleanup = prompt::PromptDirGuard::new(&self.work_dir, &req.task_id);
        let prompt_file = std::fs::File::open(&prompt_path).context("opening prompt file")?;

        let mut cmd = tokio::process::Command::new(&self.claude_path);
        cmd.args(&args)
            .envs(&self.env)
            .envs(&req.env)
            .stdin(Stdio::from(prompt_file))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !req.project_path.is_empty() {
            cmd.current_dir(&req.project_path);
        }
        // Own process group so cancellation reaches the whole child tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn {:?}: is it installed and on PATH?",
                    self.claude_path
                )
            })?;

        let pid = child.id().unwrap_or(0);
        cancel.set_pid(pid);
        // Close the spawn/cancel race: a cancel that arrived while we were
        // spawning saw pid 0 and only set the flag.
        if cancel.is_cancelled() {
            kill::kill_group(pid as i32);
        }

        info!(task_id = %req.task_id, pid, "agent started");
        on_progress("started", &format!("PID {pid}"));

        let stdout = child.stdout.take().context("no stdout pipe")?;
        let stderr = child.stderr.take().context("no stderr pipe")?;

        // Stderr drains concurrently; its tail is attached to failures.
        let stderr_task_id = req.task_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = tokio::io::BufReader::new(stderr);
            if let Err(e) = reader.read_to_end(&mut buf).await {
                debug!(task_id = %stderr_task_id, err = %e, "stderr read error");
            }
            let text = String::from_utf8_lossy(&buf).into_owned();
            if !text.is_empty() {
                debug!(
                    task_id = %stderr_task_id,
                    stderr = %truncate(&text, STDERR_SNIPPET_BYTES),
                    "agent stderr"
                );
            }
            text
        });

        let mut result = ExecResult::default();
        let mut duration_from_stream = None;
        let mut lines = FramedRead::new(
            stdout,
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );

        // The stdout drain must complete before wait() so the pipe is not
        // closed out from under the parser.
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // cancel() already SIGKILLed the process group; stop
                    // consuming and go reap.
                    break;
                }

                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        let event = match parse_stream_line(&line) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                debug!(
                                    task_id = %req.task_id,
                                    err = %e,
                                    line_preview = %truncate(&line, 100),
                                    "malformed JSON in stream"
                                );
                                continue;
                            }
                        };
                        match event {
                            StreamEvent::System { subtype, session_id } => {
                                if subtype == "init" && !session_id.is_empty() {
                                    debug!(task_id = %req.task_id, session_id = %session_id, "session initialized");
                                    result.session_id = session_id;
                                }
                            }
                            StreamEvent::Assistant { message } => {
                                result.output.push_str(&extract_output(&message));
                                if let Some(progress) = extract_progress(&message) {
                                    on_progress("progress", &progress);
                                }
                            }
                            StreamEvent::Result { cost_usd, duration_ms, num_turns, .. } => {
                                result.cost_usd = cost_usd;
                                result.turns = num_turns;
                                if duration_ms > 0 {
                                    duration_from_stream =
                                        Some(std::time::Duration::from_millis(duration_ms as u64));
                                }
                            }
                            StreamEvent::Unknown => {}
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The codec discards until the next newline.
                        warn!(task_id = %req.task_id, max = MAX_LINE_BYTES, "oversized stream line skipped");
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        warn!(task_id = %req.task_id, err = %e, "stream read error");
                        break;
                    }
                    None => break,
                },
            }
        }

        let stderr_text = stderr_task.await.unwrap_or_default();
        let status = child.wait().await.context("waiting for agent")?;
        cancel.set_pid(0);
        result.duration = duration_from_stream.unwrap_or_else(|| start.elapsed());

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled {
                result: Box::new(result),
            });
        }

        if !status.success() {
            result.exit_code = status.code().unwrap_or(-1);
            warn!(
                task_id = %req.task_id,
                exit_code = result.exit_code,
                duration = ?result.duration,
                "agent exited with error"
            );
            return Err(ExecError::Exit {
                result: Box::new(result),
                stderr_tail: truncate(&stderr_text, STDERR_SNIPPET_BYTES),
            });
        }

        info!(
            task_id = %req.task_id,
            duration = ?result.duration,
            cost_usd = result.cost_usd,
            turns = result.turns,
            "agent completed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn executor(script: &Path, work_dir: &Path) -> ClaudeExecutor {
        ClaudeExecutor {
            claude_path: script.to_string_lossy().into_owned(),
            work_dir: work_dir.to_path_buf(),
            env: Default::default(),
        }
    }

    fn progress_recorder() -> (Arc<Mutex<Vec<(String, String)>>>, ProgressFn) {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let f: ProgressFn = Arc::new(move |event: &str, msg: &str| {
            sink.lock().unwrap().push((event.to_string(), msg.to_string()));
        });
        (seen, f)
    }

    fn request(task_id: &str) -> Request {
        Request {
            task_id: task_id.to_string(),
            prompt: "do the thing".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mixed_stream_parses_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}'\n",
                "echo '{broken}'\n",
                "echo ''\n",
                "echo '{\"type\":\"assistant\",\"message\":{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\n",
                "echo '{\"type\":\"result\",\"subtype\":\"success\",\"cost_usd\":0.5,\"num_turns\":2}'",
            ),
        );
        let exec = executor(&script, dir.path());
        let (seen, on_progress) = progress_recorder();

        let result = exec
            .execute(request("t-mix"), CancelHandle::new(), on_progress)
            .await
            .unwrap();

        assert_eq!(result.session_id, "s1");
        assert_eq!(result.output, "ok");
        assert!((result.cost_usd - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.turns, 2);

        let events = seen.lock().unwrap();
        let progress: Vec<_> = events.iter().filter(|(e, _)| e == "progress").collect();
        assert_eq!(progress.len(), 1, "exactly one progress callback: {events:?}");
        assert_eq!(progress[0].1, "ok");
        assert!(events[0].0 == "started" && events[0].1.starts_with("PID "));

        // Prompt directory removed on exit.
        assert!(!dir.path().join("tasks").join("t-mix").exists());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'model overloaded' >&2\nexit 3");
        let exec = executor(&script, dir.path());
        let (_, on_progress) = progress_recorder();

        let err = exec
            .execute(request("t-fail"), CancelHandle::new(), on_progress)
            .await
            .unwrap_err();

        match err {
            ExecError::Exit {
                result,
                stderr_tail,
            } => {
                assert_eq!(result.exit_code, 3);
                assert!(stderr_tail.contains("model overloaded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!dir.path().join("tasks").join("t-fail").exists());
    }

    #[tokio::test]
    async fn duration_ms_from_stream_overrides_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo '{\"type\":\"result\",\"subtype\":\"success\",\"cost_usd\":0.1,\"duration_ms\":45000,\"num_turns\":1}'",
        );
        let exec = executor(&script, dir.path());
        let (_, on_progress) = progress_recorder();

        let result = exec
            .execute(request("t-dur"), CancelHandle::new(), on_progress)
            .await
            .unwrap();
        assert_eq!(result.duration, std::time::Duration::from_millis(45000));
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_and_parsing_continues() {
        let dir = tempfile::tempdir().unwrap();
        // One line just over the 10 MiB cap, then a normal result event.
        let script = write_script(
            dir.path(),
            concat!(
                r##"printf '%s' '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"'"##,
                "\n",
                "head -c 11000000 /dev/zero | tr '\\0' a\n",
                r##"printf '%s\n' '"}]}}'"##,
                "\n",
                r##"echo '{"type":"result","subtype":"success","cost_usd":0.1,"num_turns":1}'"##,
            ),
        );
        let exec = executor(&script, dir.path());
        let (_, on_progress) = progress_recorder();

        let result = exec
            .execute(request("t-big"), CancelHandle::new(), on_progress)
            .await
            .unwrap();
        assert_eq!(result.output, "", "oversized line must not reach output");
        assert!((result.cost_usd - 0.1).abs() < f64::EPSILON);
        assert_eq!(result.turns, 1);
    }

    #[tokio::test]
    async fn cancellation_kills_child_and_leaves_no_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 60");
        let exec = Arc::new(executor(&script, dir.path()));
        let (_, on_progress) = progress_recorder();

        let cancel = CancelHandle::new();
        let handle = cancel.clone();
        let task = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute(request("t-cancel"), handle, on_progress).await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let pid = cancel.pid();
        assert_ne!(pid, 0, "child should be running");
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }), "{err:?}");
        assert!(!kill::pid_alive(pid as i32), "child must be gone");
        assert!(!dir.path().join("tasks").join("t-cancel").exists());
    }

    #[tokio::test]
    async fn dry_run_skips_spawn() {
        let dir = tempfile::tempdir().unwrap();
        // Deliberately not executable; a spawn attempt would fail loudly.
        let script = dir.path().join("missing-agent");
        let exec = executor(&script, dir.path());
        let (seen, on_progress) = progress_recorder();

        let mut req = request("t-dry");
        req.dry_run = true;
        req.model = "sonnet".into();
        req.allowed_tools = vec!["Read".into(), "Edit".into()];

        let result = exec
            .execute(req, CancelHandle::new(), on_progress)
            .await
            .unwrap();
        assert!(result.output.starts_with("[dry-run]"));
        assert!(result.output.contains("--model sonnet"));
        assert!(result.output.contains("--allowedTools Read"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn arg_construction() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(Path::new("claude"), dir.path());
        let mut req = request("t");
        req.model = "opus".into();
        req.session_id = "ses_1".into();
        req.allowed_tools = vec!["Read".into()];

        let args = exec.build_args(&req);
        assert_eq!(
            args,
            vec![
                "-p",
                "--verbose",
                "--output-format",
                "stream-json",
                "--model",
                "opus",
                "--resume",
                "ses_1",
                "--allowedTools",
                "Read",
            ]
        );
    }
}
