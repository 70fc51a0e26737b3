//! Task model: status state machine, priorities, and snapshots.

pub mod manager;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::storage::TaskRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Linked,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Linked => "linked",
        }
    }

    /// Terminal states never transition again. `linked` records are
    /// terminal but remain updatable in place through the manager.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Linked
        )
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "linked" => Ok(Self::Linked),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete set of legal status transitions. Anything else is a bug in
/// the caller and is rejected as a conflict.
pub fn can_transition(from: Status, to: Status) -> bool {
    use Status::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Running)
            | (Queued, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Admission rank; higher pops first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" | "" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskKind {
    #[default]
    Dispatched,
    Linked,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Linked => "linked",
        }
    }
}

/// One unit of tracked work. Owned by the task manager; everything handed
/// out is a value copy.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub project: String,
    pub prompt: String,
    pub priority: Priority,
    pub status: Status,
    /// Agent conversation id (resume handle for dispatched tasks, identity
    /// key for linked ones).
    pub session_id: String,
    /// PID of the owning child process; 0 except while running.
    pub pid: u32,
    pub git_branch: String,
    pub output: String,
    pub progress: String,
    pub error: String,
    pub cost_usd: f64,
    pub turns: i64,
    pub timeout: Duration,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub kind: TaskKind,
    /// Human-readable intent, shown in listings.
    pub context: String,
    /// Linked tasks: label of the sub-task currently in progress.
    pub current_task: String,
    /// Linked tasks: files touched so far.
    pub files_modified: Vec<String>,
    /// Execution parameters, not persisted.
    pub model: String,
    pub allowed_tools: Vec<String>,
    /// MCP session that initiated the task; targets its notifications.
    pub mcp_session_id: String,
}

fn generate_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("t-{}", &hex[..8])
}

impl Task {
    pub fn new_dispatched(project: &str, prompt: &str, priority: Priority) -> Self {
        Self {
            id: generate_id(),
            project: project.to_string(),
            prompt: prompt.to_string(),
            priority,
            status: Status::Pending,
            session_id: String::new(),
            pid: 0,
            git_branch: String::new(),
            output: String::new(),
            progress: String::new(),
            error: String::new(),
            cost_usd: 0.0,
            turns: 0,
            timeout: Duration::from_secs(30 * 60),
            dry_run: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            kind: TaskKind::Dispatched,
            context: String::new(),
            current_task: String::new(),
            files_modified: Vec::new(),
            model: String::new(),
            allowed_tools: Vec::new(),
            mcp_session_id: String::new(),
        }
    }

    pub fn new_linked(
        session_id: &str,
        project: &str,
        summary: &str,
        current_task: &str,
        git_branch: &str,
        turns: i64,
        files_modified: Vec<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: Status::Linked,
            kind: TaskKind::Linked,
            output: summary.to_string(),
            current_task: current_task.to_string(),
            git_branch: git_branch.to_string(),
            turns,
            files_modified,
            completed_at: Some(Utc::now()),
            ..Self::new_dispatched(project, "", Priority::Normal)
        }
    }

    /// Wall-clock duration: elapsed while running, total once terminal.
    pub fn duration(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = match self.completed_at {
            Some(t) => t,
            None => Utc::now(),
        };
        (end - started).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn format_duration(&self) -> String {
        let secs = self.duration().as_secs();
        if secs >= 3600 {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        } else if secs >= 60 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{secs}s")
        }
    }

    // ─── Persistence mapping ────────────────────────────────────────────────

    pub fn to_row(&self) -> TaskRow {
        TaskRow {
            id: self.id.clone(),
            project: self.project.clone(),
            prompt: self.prompt.clone(),
            status: self.status.as_str().to_string(),
            priority: self.priority.as_str().to_string(),
            session_id: self.session_id.clone(),
            pid: self.pid as i64,
            git_branch: self.git_branch.clone(),
            output: self.output.clone(),
            progress: self.progress.clone(),
            error: self.error.clone(),
            cost_usd: self.cost_usd,
            turns: self.turns,
            timeout_minutes: (self.timeout.as_secs() / 60) as i64,
            dry_run: self.dry_run,
            created_at: self.created_at.to_rfc3339(),
            started_at: self.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            completed_at: self
                .completed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            kind: self.kind.as_str().to_string(),
            context: self.context.clone(),
            current_task: self.current_task.clone(),
            files_modified: serde_json::to_string(&self.files_modified)
                .unwrap_or_else(|_| "[]".to_string()),
        }
    }

    pub fn from_row(row: &TaskRow) -> Self {
        Self {
            id: row.id.clone(),
            project: row.project.clone(),
            prompt: row.prompt.clone(),
            status: row.status.parse().unwrap_or(Status::Failed),
            priority: row.priority.parse().unwrap_or_default(),
            session_id: row.session_id.clone(),
            pid: row.pid.max(0) as u32,
            git_branch: row.git_branch.clone(),
            output: row.output.clone(),
            progress: row.progress.clone(),
            error: row.error.clone(),
            cost_usd: row.cost_usd,
            turns: row.turns,
            timeout: Duration::from_secs(row.timeout_minutes.max(1) as u64 * 60),
            dry_run: row.dry_run,
            created_at: parse_time(&row.created_at).unwrap_or_else(Utc::now),
            started_at: parse_time(&row.started_at),
            completed_at: parse_time(&row.completed_at),
            kind: if row.kind == "linked" {
                TaskKind::Linked
            } else {
                TaskKind::Dispatched
            },
            context: row.context.clone(),
            current_task: row.current_task.clone(),
            files_modified: serde_json::from_str(&row.files_modified).unwrap_or_default(),
            model: String::new(),
            allowed_tools: Vec::new(),
            mcp_session_id: String::new(),
        }
    }
}

fn parse_time(rfc3339: &str) -> Option<DateTime<Utc>> {
    if rfc3339.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(rfc3339)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Listing filter. `status` is `"all"` or a specific status string.
#[derive(Debug, Clone)]
pub struct Filter {
    pub status: String,
    pub project: String,
    pub limit: usize,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            status: "all".to_string(),
            project: String::new(),
            limit: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_covers_legal_path() {
        use Status::*;
        assert!(can_transition(Pending, Queued));
        assert!(can_transition(Queued, Running));
        assert!(can_transition(Queued, Cancelled));
        assert!(can_transition(Running, Completed));
        assert!(can_transition(Running, Failed));
        assert!(can_transition(Running, Cancelled));
    }

    #[test]
    fn transition_table_rejects_back_edges() {
        use Status::*;
        for terminal in [Completed, Failed, Cancelled, Linked] {
            for to in [Pending, Queued, Running, Completed, Failed, Cancelled, Linked] {
                assert!(
                    !can_transition(terminal, to),
                    "{terminal} → {to} must be rejected"
                );
            }
        }
        assert!(!can_transition(Pending, Running));
        assert!(!can_transition(Pending, Cancelled));
        assert!(!can_transition(Running, Queued));
        assert!(!can_transition(Queued, Pending));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Normal.rank() > Priority::Low.rank());
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn generated_ids_are_short_and_unique() {
        let a = generate_id();
        let b = generate_id();
        assert!(a.starts_with("t-"));
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }

    #[test]
    fn row_round_trip() {
        let mut task = Task::new_dispatched("demo", "fix it", Priority::High);
        task.status = Status::Queued;
        task.context = "fixing a bug".into();
        let row = task.to_row();
        assert_eq!(row.status, "queued");
        assert_eq!(row.priority, "high");
        assert_eq!(row.kind, "dispatched");

        let back = Task::from_row(&row);
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, Status::Queued);
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.context, "fixing a bug");
        assert!(back.started_at.is_none());
    }

    #[test]
    fn linked_row_round_trip() {
        let task = Task::new_linked(
            "ses_1",
            "demo",
            "refactored auth",
            "writing tests",
            "feature/auth",
            7,
            vec!["src/auth.rs".into(), "src/lib.rs".into()],
        );
        assert_eq!(task.status, Status::Linked);
        assert_eq!(task.kind, TaskKind::Linked);

        let back = Task::from_row(&task.to_row());
        assert_eq!(back.kind, TaskKind::Linked);
        assert_eq!(back.session_id, "ses_1");
        assert_eq!(back.current_task, "writing tests");
        assert_eq!(back.files_modified.len(), 2);
        assert_eq!(back.turns, 7);
    }

    #[test]
    fn duration_formatting() {
        let mut task = Task::new_dispatched("demo", "p", Priority::Normal);
        assert_eq!(task.format_duration(), "0s");

        let start = Utc::now() - chrono::Duration::seconds(95);
        task.started_at = Some(start);
        task.completed_at = Some(start + chrono::Duration::seconds(83));
        assert_eq!(task.format_duration(), "1m23s");

        task.completed_at = Some(start + chrono::Duration::seconds(3723));
        assert_eq!(task.format_duration(), "1h2m3s");
    }
}
