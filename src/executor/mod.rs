//! Agent CLI executors.
//!
//! An executor owns the controlled spawn/stream/cancel/reap of one external
//! agent process per task. Implementations are looked up by name from a
//! process-wide registry populated before serving begins.

pub mod claude;
pub mod kill;
pub mod prompt;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::Notify;

/// Parameters for one agent execution.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub task_id: String,
    pub prompt: String,
    pub project_path: String,
    /// Resume an existing agent conversation when non-empty.
    pub session_id: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub dry_run: bool,
    pub env: HashMap<String, String>,
}

/// Outcome of an agent execution. Partial results (session id, output so
/// far) are also attached to failures so callers can surface them.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub session_id: String,
    pub output: String,
    pub cost_usd: f64,
    pub turns: i64,
    pub duration: Duration,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The execution was cancelled; the process group is already gone.
    #[error("execution cancelled")]
    Cancelled { result: Box<ExecResult> },

    /// The agent exited non-zero. `result.exit_code` carries the code.
    #[error("agent exited with code {}: {stderr_tail}", result.exit_code)]
    Exit {
        result: Box<ExecResult>,
        stderr_tail: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecError {
    /// The partial result parsed before the failure, if any.
    pub fn partial_result(&self) -> Option<&ExecResult> {
        match self {
            Self::Cancelled { result } | Self::Exit { result, .. } => Some(result),
            Self::Internal(_) => None,
        }
    }
}

/// Progress callback: `(event, message)` pairs such as
/// `("started", "PID 1234")` or `("progress", "Using tool: Edit")`.
pub type ProgressFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        req: Request,
        cancel: CancelHandle,
        on_progress: ProgressFn,
    ) -> Result<ExecResult, ExecError>;
}

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Shared between the driver (which registers the child PID and watches for
/// cancellation) and the task manager (which triggers it).
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    /// PID of the running child, 0 when none.
    pid: AtomicU32,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination: mark cancelled, kill the child's process group
    /// if one is running, and wake the driver's select loop.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let pid = self.inner.pid.load(Ordering::Relaxed);
        if pid != 0 {
            kill::kill_group(pid as i32);
        }
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }

    pub fn set_pid(&self, pid: u32) {
        self.inner.pid.store(pid, Ordering::Relaxed);
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid.load(Ordering::Relaxed)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Construction-time settings shared by all executors.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub claude_path: String,
    pub work_dir: std::path::PathBuf,
    pub env: HashMap<String, String>,
}

pub type Factory = fn(&Settings) -> anyhow::Result<Arc<dyn Executor>>;

static REGISTRY: Lazy<std::sync::RwLock<HashMap<&'static str, Factory>>> =
    Lazy::new(|| std::sync::RwLock::new(HashMap::new()));

/// Register an executor factory. Duplicate registration is a startup
/// configuration bug and panics.
pub fn register(name: &'static str, factory: Factory) {
    let mut reg = REGISTRY
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if reg.insert(name, factory).is_some() {
        panic!("executor: duplicate registration for {name:?}");
    }
}

pub fn create(name: &str, settings: &Settings) -> anyhow::Result<Arc<dyn Executor>> {
    let reg = REGISTRY
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let factory = reg
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown executor {name:?}"))?;
    factory(settings)
}

pub fn available() -> Vec<String> {
    let reg = REGISTRY
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut names: Vec<String> = reg.keys().map(|s| s.to_string()).collect();
    names.sort();
    names
}

/// Register all built-in executors. Idempotent so repeated wiring (tests,
/// embedded use) does not trip the duplicate-registration panic.
pub fn register_builtins() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        register("claude-code", claude::factory);
    });
}
