//! The task lifecycle manager.
//!
//! Owns every task record for the process lifetime. All mutation goes
//! through manager operations under one mutex; snapshots handed out are
//! value copies. Admission is gated per project (priority-ordered, FIFO
//! within a priority class) and globally by a semaphore sized to
//! `execution.max_concurrent`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::{can_transition, Filter, Status, Task, TaskKind};
use crate::error::Error;
use crate::executor::{kill, CancelHandle, ExecError, Executor, ProgressFn, Request};
use crate::notify::{Event, EventKind, Hub};
use crate::project::ProjectManager;
use crate::storage::PersistMsg;

/// Waiting-set entry. The heap pops highest priority first, oldest first
/// within a priority class.
struct QueuedRef {
    id: String,
    rank: u8,
    created_at: DateTime<Utc>,
}

impl Ord for QueuedRef {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank
            .cmp(&other.rank)
            .then(other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueuedRef {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedRef {}

struct Gate {
    waiting: BinaryHeap<QueuedRef>,
    running: usize,
    max: usize,
}

struct TaskEntry {
    task: Task,
    cancel: CancelHandle,
}

struct Inner {
    tasks: HashMap<String, TaskEntry>,
    gates: HashMap<String, Gate>,
}

pub struct TaskManager {
    inner: Mutex<Inner>,
    global: Arc<Semaphore>,
    executor: Arc<dyn Executor>,
    projects: Arc<ProjectManager>,
    persist: mpsc::UnboundedSender<PersistMsg>,
    hub: Hub,
}

impl TaskManager {
    pub fn new(
        executor: Arc<dyn Executor>,
        projects: Arc<ProjectManager>,
        max_concurrent: usize,
        persist: mpsc::UnboundedSender<PersistMsg>,
        hub: Hub,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                gates: HashMap::new(),
            }),
            global: Arc::new(Semaphore::new(max_concurrent.max(1))),
            executor,
            projects,
            persist,
            hub,
        })
    }

    // ─── Registration and lookup ────────────────────────────────────────────

    /// Insert a new task (`pending` for dispatched, `linked` for externally
    /// reported ones) and persist it immediately.
    pub fn register(&self, task: Task) -> Result<Task, Error> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::conflict(format!(
                "task {} already registered",
                task.id
            )));
        }
        if task.kind == TaskKind::Linked && task.session_id.is_empty() {
            return Err(Error::invalid("linked tasks require a session_id"));
        }
        if task.kind == TaskKind::Dispatched && task.prompt.is_empty() {
            return Err(Error::invalid("dispatched tasks require a prompt"));
        }

        let snapshot = task.clone();
        self.persist_task(&task);
        match task.kind {
            TaskKind::Linked => {
                self.log_event(&task.id, "task.linked", &task.output);
                self.hub
                    .notify(self.event(&task, EventKind::Linked, &task.output));
            }
            TaskKind::Dispatched => {
                self.log_event(&task.id, "task.created", &task.context);
            }
        }
        inner.tasks.insert(
            task.id.clone(),
            TaskEntry {
                task,
                cancel: CancelHandle::new(),
            },
        );
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Result<Task, Error> {
        let inner = self.lock();
        inner
            .tasks
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| Error::not_found(format!("task {id:?}")))
    }

    /// Find a task by agent session id and status.
    pub fn get_by_session(&self, session_id: &str, status: Status) -> Option<Task> {
        let inner = self.lock();
        inner
            .tasks
            .values()
            .find(|e| e.task.session_id == session_id && e.task.status == status)
            .map(|e| e.task.clone())
    }

    pub fn list(&self, filter: &Filter) -> Vec<Task> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| {
                (filter.status == "all"
                    || filter.status.is_empty()
                    || t.status.as_str() == filter.status)
                    && (filter.project.is_empty() || t.project == filter.project)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            tasks.truncate(filter.limit);
        }
        tasks
    }

    // ─── Dispatch and admission ─────────────────────────────────────────────

    /// Transition `pending → queued` and post the task to its project's
    /// admission gate.
    pub fn dispatch(self: &Arc<Self>, id: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("task {id:?}")))?;

        if entry.task.status != Status::Pending {
            return Err(Error::conflict(format!(
                "task {id} is {}, only pending tasks can be dispatched",
                entry.task.status
            )));
        }
        entry.task.status = Status::Queued;

        let project = entry.task.project.clone();
        let queued = QueuedRef {
            id: id.to_string(),
            rank: entry.task.priority.rank(),
            created_at: entry.task.created_at,
        };
        let snapshot = entry.task.clone();
        self.persist_task(&snapshot);
        self.log_event(id, "task.queued", "");

        let max = self
            .projects
            .get(&project)
            .map(|p| p.max_concurrent_tasks)
            .unwrap_or(1);
        inner
            .gates
            .entry(project.clone())
            .or_insert_with(|| Gate {
                waiting: BinaryHeap::new(),
                running: 0,
                max,
            })
            .waiting
            .push(queued);

        self.pump(&mut inner, &project);
        Ok(())
    }

    /// Admit waiting tasks while the project has free slots. Caller holds
    /// the lock.
    fn pump(self: &Arc<Self>, inner: &mut Inner, project: &str) {
        loop {
            let Some(gate) = inner.gates.get_mut(project) else {
                return;
            };
            if gate.running >= gate.max {
                return;
            }
            let Some(next) = gate.waiting.pop() else {
                return;
            };
            // Entries cancelled while waiting are tombstones, skip them.
            let still_queued = inner
                .tasks
                .get(&next.id)
                .map(|e| e.task.status == Status::Queued)
                .unwrap_or(false);
            if !still_queued {
                continue;
            }

            let gate = inner.gates.get_mut(project).expect("gate exists");
            gate.running += 1;

            let mgr = self.clone();
            let id = next.id.clone();
            let project = project.to_string();
            tokio::spawn(async move {
                mgr.run_task(id, project).await;
            });
        }
    }

    /// Drive one admitted task: global slot, git preparation, execution,
    /// finalisation. Holds its project slot for its whole lifetime.
    async fn run_task(self: Arc<Self>, id: String, project_name: String) {
        let Some(cancel) = self.cancel_handle(&id) else {
            self.release_slot(&project_name);
            return;
        };

        // The global cap applies while still queued; cancellation during
        // the wait releases the project slot without running.
        let permit = tokio::select! {
            permit = self.global.clone().acquire_owned() => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => {
                self.release_slot(&project_name);
                return;
            }
        };

        let branch = self.prepare_git(&id, &project_name);

        let req = {
            let mut inner = self.lock();
            let Some(entry) = inner.tasks.get_mut(&id) else {
                drop(inner);
                drop(permit);
                self.release_slot(&project_name);
                return;
            };
            if entry.task.status != Status::Queued {
                // Cancelled between admission and start.
                drop(inner);
                drop(permit);
                self.release_slot(&project_name);
                return;
            }
            entry.task.status = Status::Running;
            entry.task.started_at = Some(Utc::now());
            if let Some(branch) = branch {
                entry.task.git_branch = branch;
            }
            let task = &entry.task;
            let project_path = self
                .projects
                .get(&project_name)
                .map(|p| p.path.to_string_lossy().into_owned())
                .unwrap_or_default();
            Request {
                task_id: task.id.clone(),
                prompt: task.prompt.clone(),
                project_path,
                session_id: task.session_id.clone(),
                model: task.model.clone(),
                allowed_tools: task.allowed_tools.clone(),
                dry_run: task.dry_run,
                env: HashMap::new(),
            }
        };
        let timeout = self
            .get(&id)
            .map(|t| t.timeout)
            .unwrap_or(std::time::Duration::from_secs(30 * 60));

        let mgr = self.clone();
        let progress_id = id.clone();
        let on_progress: ProgressFn = Arc::new(move |event, message| match event {
            "started" => mgr.mark_started(&progress_id),
            _ => mgr.set_progress(&progress_id, message),
        });

        let exec = self.executor.clone();
        let fut = exec.execute(req, cancel.clone(), on_progress);
        tokio::pin!(fut);
        let mut timed_out = false;
        let result = tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(timeout) => {
                warn!(task_id = %id, ?timeout, "task timed out, killing process group");
                timed_out = true;
                cancel.cancel();
                // The kill makes the driver return promptly; reap it so no
                // child outlives the task.
                fut.await
            }
        };

        drop(permit);
        self.finalize(&id, &project_name, result, timed_out, timeout);
    }

    /// Auto-branch / auto-stash preparation. Failures are logged, not
    /// fatal; the task still runs on the current branch.
    fn prepare_git(&self, id: &str, project_name: &str) -> Option<String> {
        let project = self.projects.get(project_name).ok()?;
        if !project.auto_branch && !project.auto_stash {
            return None;
        }
        let git = project.git();
        if !git.is_repo() || !git.has_commits() {
            return None;
        }

        if project.auto_stash {
            match git.is_clean() {
                Ok(false) => {
                    if let Err(e) = git.stash() {
                        warn!(task_id = %id, err = %e, "auto-stash failed");
                    }
                }
                Ok(true) => {}
                Err(e) => warn!(task_id = %id, err = %e, "git status failed"),
            }
        }

        if project.auto_branch {
            let branch = format!("{}{}", project.branch_prefix, id);
            match git.create_branch(&branch) {
                Ok(()) => return Some(branch),
                Err(e) => warn!(task_id = %id, err = %e, "auto-branch failed"),
            }
        }
        None
    }

    fn finalize(
        self: &Arc<Self>,
        id: &str,
        project: &str,
        result: Result<crate::executor::ExecResult, ExecError>,
        timed_out: bool,
        timeout: std::time::Duration,
    ) {
        let notification = {
            let mut inner = self.lock();
            if let Some(gate) = inner.gates.get_mut(project) {
                gate.running = gate.running.saturating_sub(1);
            }
            let Some(entry) = inner.tasks.get_mut(id) else {
                self.pump(&mut inner, project);
                return;
            };
            let task = &mut entry.task;
            task.pid = 0;

            let (target, event_kind, message) = match &result {
                Ok(res) => {
                    if !res.session_id.is_empty() {
                        task.session_id = res.session_id.clone();
                    }
                    task.output = res.output.clone();
                    task.cost_usd = res.cost_usd;
                    task.turns = res.turns;
                    task.error.clear();
                    (Status::Completed, EventKind::Completed, String::new())
                }
                Err(err) => {
                    if let Some(partial) = err.partial_result() {
                        if !partial.session_id.is_empty() {
                            task.session_id = partial.session_id.clone();
                        }
                        if !partial.output.is_empty() {
                            task.output = partial.output.clone();
                        }
                        task.cost_usd = partial.cost_usd;
                        task.turns = partial.turns;
                    }
                    match err {
                        ExecError::Cancelled { .. } if timed_out => {
                            task.error = format!("timed out after {}s", timeout.as_secs());
                            (Status::Failed, EventKind::Failed, task.error.clone())
                        }
                        ExecError::Cancelled { .. } => {
                            (Status::Cancelled, EventKind::Cancelled, String::new())
                        }
                        ExecError::Exit {
                            result,
                            stderr_tail,
                        } => {
                            task.error = format!(
                                "agent exited with code {}: {}",
                                result.exit_code, stderr_tail
                            );
                            (Status::Failed, EventKind::Failed, task.error.clone())
                        }
                        ExecError::Internal(e) => {
                            task.error = format!("{e:#}");
                            (Status::Failed, EventKind::Failed, task.error.clone())
                        }
                    }
                }
            };

            if can_transition(task.status, target) {
                task.status = target;
            } else {
                // Only reachable through a manager bug.
                debug_assert!(
                    false,
                    "illegal transition {} → {} for {id}",
                    task.status, target
                );
                task.status = Status::Failed;
                task.error = format!("internal: illegal transition to {target}");
            }
            task.completed_at = Some(Utc::now());

            info!(
                task_id = %id,
                status = %task.status,
                duration = %task.format_duration(),
                "task finished"
            );
            let snapshot = task.clone();
            self.persist_task(&snapshot);
            self.log_event(id, event_kind.as_str(), &message);
            self.event(&snapshot, event_kind, &message)
        };
        self.hub.notify(notification);

        let mut inner = self.lock();
        self.pump(&mut inner, project);
    }

    // ─── Cancellation ───────────────────────────────────────────────────────

    /// Request task termination.
    ///
    /// Queued tasks cancel immediately; running tasks have their process
    /// group killed and transition once the runner reaps the child.
    /// Cancelling a terminal task fails without altering state.
    pub fn cancel(&self, id: &str) -> Result<(), Error> {
        let notification = {
            let mut inner = self.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("task {id:?}")))?;

            match entry.task.status {
                Status::Queued => {
                    entry.cancel.cancel();
                    entry.task.status = Status::Cancelled;
                    entry.task.completed_at = Some(Utc::now());
                    let snapshot = entry.task.clone();
                    self.persist_task(&snapshot);
                    self.log_event(id, "task.cancelled", "cancelled while queued");
                    Some(self.event(&snapshot, EventKind::Cancelled, "cancelled while queued"))
                }
                Status::Running => {
                    debug!(task_id = %id, pid = entry.cancel.pid(), "killing running task");
                    entry.cancel.cancel();
                    None // the runner transitions on reap
                }
                Status::Pending => {
                    return Err(Error::conflict(format!(
                        "task {id} is pending, dispatch has not started"
                    )));
                }
                status => {
                    return Err(Error::conflict(format!(
                        "task {id} is already {status}"
                    )));
                }
            }
        };
        if let Some(notification) = notification {
            self.hub.notify(notification);
        }
        Ok(())
    }

    // ─── Field mutation ─────────────────────────────────────────────────────

    pub fn set_output(&self, id: &str, output: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("task {id:?}")))?;
        entry.task.output = output.to_string();
        let snapshot = entry.task.clone();
        self.persist_task(&snapshot);
        Ok(())
    }

    /// Update the mutable detail fields of a linked task.
    pub fn set_linked_fields(
        &self,
        id: &str,
        project: &str,
        git_branch: &str,
        current_task: &str,
        turns: i64,
        files_modified: Vec<String>,
    ) -> Result<(), Error> {
        let notification = {
            let mut inner = self.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("task {id:?}")))?;
            if entry.task.kind != TaskKind::Linked {
                return Err(Error::conflict(format!("task {id} is not a linked task")));
            }
            if !project.is_empty() {
                entry.task.project = project.to_string();
            }
            if !git_branch.is_empty() {
                entry.task.git_branch = git_branch.to_string();
            }
            if !current_task.is_empty() {
                entry.task.current_task = current_task.to_string();
            }
            if turns > 0 {
                entry.task.turns = turns;
            }
            if !files_modified.is_empty() {
                entry.task.files_modified = files_modified;
            }
            let snapshot = entry.task.clone();
            self.persist_task(&snapshot);
            self.log_event(id, "task.linked", &snapshot.output);
            self.event(&snapshot, EventKind::Linked, &snapshot.output)
        };
        self.hub.notify(notification);
        Ok(())
    }

    // ─── Startup replay ─────────────────────────────────────────────────────

    /// Replay persisted tasks after a restart. Non-terminal tasks whose
    /// PIDs no longer exist are failed as interrupted; everything else is
    /// restored as-is. Returns `(restored, failed)`.
    pub fn restore(&self, rows: &[crate::storage::TaskRow]) -> (usize, usize) {
        let mut restored = 0;
        let mut failed = 0;
        let mut inner = self.lock();
        for row in rows {
            let mut task = Task::from_row(row);
            if !task.status.is_terminal() && !kill::pid_alive(task.pid as i32) {
                warn!(task_id = %task.id, status = %task.status, "task interrupted by restart");
                task.status = Status::Failed;
                task.error = "interrupted by restart".to_string();
                task.completed_at = Some(Utc::now());
                task.pid = 0;
                self.persist_task(&task);
                self.log_event(&task.id, "task.failed", &task.error);
                failed += 1;
            } else {
                restored += 1;
            }
            inner.tasks.insert(
                task.id.clone(),
                TaskEntry {
                    task,
                    cancel: CancelHandle::new(),
                },
            );
        }
        (restored, failed)
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("task manager lock")
    }

    fn cancel_handle(&self, id: &str) -> Option<CancelHandle> {
        self.lock().tasks.get(id).map(|e| e.cancel.clone())
    }

    fn release_slot(self: &Arc<Self>, project: &str) {
        let mut inner = self.lock();
        if let Some(gate) = inner.gates.get_mut(project) {
            gate.running = gate.running.saturating_sub(1);
        }
        self.pump(&mut inner, project);
    }

    /// Driver reported the child PID ("started" progress event).
    fn mark_started(&self, id: &str) {
        let notification = {
            let mut inner = self.lock();
            let Some(entry) = inner.tasks.get_mut(id) else {
                return;
            };
            entry.task.pid = entry.cancel.pid();
            let snapshot = entry.task.clone();
            self.persist_task(&snapshot);
            let message = format!("PID {}", snapshot.pid);
            self.log_event(id, "task.started", &message);
            self.event(&snapshot, EventKind::Started, &message)
        };
        self.hub.notify(notification);
    }

    /// Record the latest progress string for a task. Persists and
    /// notifies; the sink layer debounces delivery.
    pub fn set_progress(&self, id: &str, message: &str) {
        let notification = {
            let mut inner = self.lock();
            let Some(entry) = inner.tasks.get_mut(id) else {
                return;
            };
            entry.task.progress = message.to_string();
            let snapshot = entry.task.clone();
            self.persist_task(&snapshot);
            self.log_event(id, "task.progress", message);
            self.event(&snapshot, EventKind::Progress, message)
        };
        self.hub.notify(notification);
    }

    fn persist_task(&self, task: &Task) {
        let _ = self.persist.send(PersistMsg::Task(Box::new(task.to_row())));
    }

    fn log_event(&self, task_id: &str, event_type: &str, message: &str) {
        let _ = self.persist.send(PersistMsg::Event {
            task_id: task_id.to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
        });
    }

    fn event(&self, task: &Task, kind: EventKind, message: &str) -> Event {
        let mut event = Event::new(kind, &task.id, &task.project, message);
        event.mcp_session_id = task.mcp_session_id.clone();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::executor::ExecResult;
    use crate::storage::spawn_task_writer;
    use crate::tasks::Priority;
    use async_trait::async_trait;
    use std::time::Duration;

    enum Behavior {
        /// Complete immediately with this output.
        Instant(String),
        /// Fail with this exit code.
        Fail(i32),
        /// Simulate work for the given time; cancellable.
        Sleep(Duration),
        /// Run until cancelled.
        Hang,
    }

    struct MockExecutor {
        behavior: Behavior,
        started_order: Mutex<Vec<String>>,
    }

    impl MockExecutor {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                started_order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(
            &self,
            req: Request,
            cancel: CancelHandle,
            on_progress: ProgressFn,
        ) -> Result<ExecResult, ExecError> {
            self.started_order.lock().unwrap().push(req.task_id.clone());
            cancel.set_pid(4242);
            on_progress("started", "PID 4242");

            let outcome = match &self.behavior {
                Behavior::Instant(output) => Ok(ExecResult {
                    output: output.clone(),
                    session_id: "ses_mock".into(),
                    cost_usd: 0.25,
                    turns: 3,
                    ..Default::default()
                }),
                Behavior::Fail(code) => Err(ExecError::Exit {
                    result: Box::new(ExecResult {
                        exit_code: *code,
                        ..Default::default()
                    }),
                    stderr_tail: "boom".into(),
                }),
                Behavior::Sleep(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*d) => Ok(ExecResult {
                            output: "slept".into(),
                            ..Default::default()
                        }),
                        _ = cancel.cancelled() => Err(ExecError::Cancelled {
                            result: Box::new(ExecResult::default()),
                        }),
                    }
                }
                Behavior::Hang => {
                    cancel.cancelled().await;
                    Err(ExecError::Cancelled {
                        result: Box::new(ExecResult::default()),
                    })
                }
            };
            cancel.set_pid(0);
            outcome
        }
    }

    fn projects(max_concurrent_tasks: usize) -> Arc<ProjectManager> {
        let mut map = HashMap::new();
        map.insert(
            "demo".to_string(),
            ProjectConfig {
                path: "/tmp".to_string(),
                max_concurrent_tasks,
                ..Default::default()
            },
        );
        Arc::new(ProjectManager::new(&map))
    }

    fn manager(executor: Arc<dyn Executor>, per_project: usize, global: usize) -> Arc<TaskManager> {
        TaskManager::new(
            executor,
            projects(per_project),
            global,
            spawn_task_writer(None),
            Hub::default(),
        )
    }

    fn new_task() -> Task {
        Task::new_dispatched("demo", "do something", Priority::Normal)
    }

    async fn wait_for<F: Fn(&Task) -> bool>(mgr: &TaskManager, id: &str, pred: F) -> Task {
        for _ in 0..200 {
            let task = mgr.get(id).unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached for {id}: {:?}", mgr.get(id));
    }

    #[tokio::test]
    async fn lifecycle_pending_to_completed() {
        let mgr = manager(MockExecutor::new(Behavior::Instant("done".into())), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        mgr.dispatch(&task.id).unwrap();

        let done = wait_for(&mgr, &task.id, |t| t.status == Status::Completed).await;
        assert_eq!(done.output, "done");
        assert_eq!(done.session_id, "ses_mock");
        assert_eq!(done.turns, 3);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.pid, 0, "pid must be cleared once terminal");
    }

    #[tokio::test]
    async fn pid_nonzero_only_while_running() {
        let mgr = manager(MockExecutor::new(Behavior::Sleep(Duration::from_millis(200))), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        assert_eq!(mgr.get(&task.id).unwrap().pid, 0);
        mgr.dispatch(&task.id).unwrap();

        let running = wait_for(&mgr, &task.id, |t| t.pid != 0).await;
        assert_eq!(running.status, Status::Running);
        assert_eq!(running.pid, 4242);

        let done = wait_for(&mgr, &task.id, |t| t.status.is_terminal()).await;
        assert_eq!(done.pid, 0);
    }

    #[tokio::test]
    async fn failed_execution_records_exit_code() {
        let mgr = manager(MockExecutor::new(Behavior::Fail(3)), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        mgr.dispatch(&task.id).unwrap();

        let failed = wait_for(&mgr, &task.id, |t| t.status == Status::Failed).await;
        assert!(failed.error.contains("code 3"), "{}", failed.error);
        assert!(failed.error.contains("boom"));
    }

    #[tokio::test]
    async fn register_duplicate_is_conflict() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        let dup = mgr.register(task.clone());
        assert!(matches!(dup, Err(Error::Conflict(_))));
        // Unknown dispatch target is not found.
        assert!(matches!(mgr.dispatch("t-unknown"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn project_gate_limits_concurrency() {
        let exec = MockExecutor::new(Behavior::Sleep(Duration::from_millis(150)));
        let mgr = manager(exec.clone(), 1, 10);
        let t1 = mgr.register(new_task()).unwrap();
        let t2 = mgr.register(new_task()).unwrap();
        mgr.dispatch(&t1.id).unwrap();
        mgr.dispatch(&t2.id).unwrap();

        wait_for(&mgr, &t1.id, |t| t.status == Status::Running).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mgr.get(&t2.id).unwrap().status, Status::Queued);

        wait_for(&mgr, &t2.id, |t| t.status == Status::Completed).await;
        wait_for(&mgr, &t1.id, |t| t.status == Status::Completed).await;
    }

    #[tokio::test]
    async fn priority_wins_over_fifo() {
        let exec = MockExecutor::new(Behavior::Sleep(Duration::from_millis(300)));
        let mgr = manager(exec.clone(), 1, 10);

        let blocker = mgr.register(new_task()).unwrap();
        mgr.dispatch(&blocker.id).unwrap();
        wait_for(&mgr, &blocker.id, |t| t.status == Status::Running).await;

        // Enqueued while the slot is held: low first, then high.
        let low = mgr
            .register(Task::new_dispatched("demo", "low prio", Priority::Low))
            .unwrap();
        let high = mgr
            .register(Task::new_dispatched("demo", "high prio", Priority::High))
            .unwrap();
        mgr.dispatch(&low.id).unwrap();
        mgr.dispatch(&high.id).unwrap();

        wait_for(&mgr, &low.id, |t| t.status == Status::Completed).await;

        let order = exec.started_order.lock().unwrap().clone();
        assert_eq!(order, vec![blocker.id, high.id, low.id]);
    }

    #[tokio::test]
    async fn cancel_queued_task() {
        let exec = MockExecutor::new(Behavior::Sleep(Duration::from_millis(200)));
        let mgr = manager(exec, 1, 10);
        let blocker = mgr.register(new_task()).unwrap();
        mgr.dispatch(&blocker.id).unwrap();
        wait_for(&mgr, &blocker.id, |t| t.status == Status::Running).await;

        let queued = mgr.register(new_task()).unwrap();
        mgr.dispatch(&queued.id).unwrap();
        assert_eq!(mgr.get(&queued.id).unwrap().status, Status::Queued);

        mgr.cancel(&queued.id).unwrap();
        let cancelled = mgr.get(&queued.id).unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // The slot-holder is unaffected.
        wait_for(&mgr, &blocker.id, |t| t.status == Status::Completed).await;
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        mgr.dispatch(&task.id).unwrap();
        wait_for(&mgr, &task.id, |t| t.status == Status::Running).await;

        mgr.cancel(&task.id).unwrap();
        let cancelled = wait_for(&mgr, &task.id, |t| t.status == Status::Cancelled).await;
        assert!(cancelled.completed_at.is_some());
        assert_eq!(cancelled.pid, 0);
    }

    #[tokio::test]
    async fn cancel_terminal_task_is_conflict() {
        let mgr = manager(MockExecutor::new(Behavior::Instant("ok".into())), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        mgr.dispatch(&task.id).unwrap();
        wait_for(&mgr, &task.id, |t| t.status == Status::Completed).await;

        let err = mgr.cancel(&task.id).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // State unchanged.
        assert_eq!(mgr.get(&task.id).unwrap().status, Status::Completed);
    }

    #[tokio::test]
    async fn timeout_fails_the_task() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        let mut task = new_task();
        task.timeout = Duration::from_millis(100);
        let task = mgr.register(task).unwrap();
        mgr.dispatch(&task.id).unwrap();

        let failed = wait_for(&mgr, &task.id, |t| t.status == Status::Failed).await;
        assert!(failed.error.contains("timed out"), "{}", failed.error);
    }

    #[tokio::test]
    async fn global_cap_limits_across_projects() {
        let exec = MockExecutor::new(Behavior::Sleep(Duration::from_millis(120)));
        // Per-project would allow 2; the global cap of 1 serialises them.
        let mgr = manager(exec.clone(), 2, 1);
        let t1 = mgr.register(new_task()).unwrap();
        let t2 = mgr.register(new_task()).unwrap();
        mgr.dispatch(&t1.id).unwrap();
        mgr.dispatch(&t2.id).unwrap();

        wait_for(&mgr, &t1.id, |t| t.status.is_terminal()).await;
        wait_for(&mgr, &t2.id, |t| t.status.is_terminal()).await;

        // Never more than one concurrently: the second only starts after
        // the first finished, so both took ≥ 120ms each serially.
        let order = exec.started_order.lock().unwrap().clone();
        assert_eq!(order.len(), 2);
    }

    #[tokio::test]
    async fn linked_task_registration_and_update() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        let linked = mgr
            .register(Task::new_linked(
                "ses_x",
                "demo",
                "v1",
                "",
                "",
                2,
                vec![],
            ))
            .unwrap();
        assert_eq!(linked.status, Status::Linked);

        let found = mgr.get_by_session("ses_x", Status::Linked).unwrap();
        assert_eq!(found.id, linked.id);

        mgr.set_output(&linked.id, "v2").unwrap();
        mgr.set_linked_fields(&linked.id, "", "feat/x", "tests", 5, vec!["a.rs".into()])
            .unwrap();

        let updated = mgr.get(&linked.id).unwrap();
        assert_eq!(updated.output, "v2");
        assert_eq!(updated.git_branch, "feat/x");
        assert_eq!(updated.current_task, "tests");
        assert_eq!(updated.turns, 5);
        assert_eq!(updated.files_modified, vec!["a.rs"]);
    }

    #[tokio::test]
    async fn linked_fields_rejected_for_dispatched() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        let task = mgr.register(new_task()).unwrap();
        let err = mgr
            .set_linked_fields(&task.id, "", "", "x", 1, vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);
        for i in 0..5 {
            let mut t = new_task();
            t.context = format!("task {i}");
            mgr.register(t).unwrap();
        }
        mgr.register(Task::new_linked("ses_1", "other", "s", "", "", 0, vec![]))
            .unwrap();

        assert_eq!(mgr.list(&Filter::default()).len(), 6);
        assert_eq!(
            mgr.list(&Filter {
                status: "pending".into(),
                ..Default::default()
            })
            .len(),
            5
        );
        assert_eq!(
            mgr.list(&Filter {
                project: "other".into(),
                ..Default::default()
            })
            .len(),
            1
        );
        assert_eq!(
            mgr.list(&Filter {
                limit: 2,
                ..Default::default()
            })
            .len(),
            2
        );
    }

    #[tokio::test]
    async fn restore_fails_interrupted_tasks() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);

        let mut running = new_task();
        running.status = Status::Running;
        running.started_at = Some(Utc::now());
        running.pid = 999_999_990; // certainly dead

        let mut queued = new_task();
        queued.status = Status::Queued;

        let linked = Task::new_linked("ses_r", "demo", "summary", "", "", 1, vec![]);
        let mut completed = new_task();
        completed.status = Status::Completed;
        completed.started_at = Some(Utc::now());
        completed.completed_at = Some(Utc::now());

        let rows: Vec<_> = [&running, &queued, &linked, &completed]
            .iter()
            .map(|t| t.to_row())
            .collect();
        let (restored, failed) = mgr.restore(&rows);
        assert_eq!(failed, 2, "running + queued with dead PIDs fail");
        assert_eq!(restored, 2, "terminal tasks restore as-is");

        let after = mgr.get(&running.id).unwrap();
        assert_eq!(after.status, Status::Failed);
        assert!(after.error.contains("interrupted"));
        assert_eq!(after.pid, 0);

        assert_eq!(mgr.get(&linked.id).unwrap().status, Status::Linked);
        assert_eq!(mgr.get(&completed.id).unwrap().status, Status::Completed);
    }

    #[tokio::test]
    async fn register_validations() {
        let mgr = manager(MockExecutor::new(Behavior::Hang), 1, 3);

        let dispatched_without_prompt = Task::new_dispatched("demo", "", Priority::Normal);
        assert!(matches!(
            mgr.register(dispatched_without_prompt),
            Err(Error::InvalidArgument(_))
        ));

        let mut linked_without_session = Task::new_linked("s", "demo", "x", "", "", 0, vec![]);
        linked_without_session.session_id = String::new();
        assert!(matches!(
            mgr.register(linked_without_session),
            Err(Error::InvalidArgument(_))
        ));
    }
}
