//! Task event fan-out.
//!
//! The hub owns its sinks. Each sink drains its own queue on a dedicated
//! tokio task, so emitters (the task manager and executor runners) never
//! block on delivery, while events still reach every sink in emission
//! order.

pub mod mcp;

use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Linked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "task.started",
            Self::Progress => "task.progress",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
            Self::Cancelled => "task.cancelled",
            Self::Linked => "task.linked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub task_id: String,
    pub project: String,
    pub message: String,
    /// When non-empty the notification is delivered only to this MCP
    /// session; otherwise it is broadcast.
    pub mcp_session_id: String,
}

impl Event {
    pub fn new(kind: EventKind, task_id: &str, project: &str, message: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            project: project.to_string(),
            message: message.to_string(),
            mcp_session_id: String::new(),
        }
    }
}

/// A notification sink. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Owns the sinks and fans events out to all of them.
///
/// Each sink gets its own queue and drain task: emitting never blocks, and
/// a sink sees the events of any one task in the order they were produced.
#[derive(Default, Clone)]
pub struct Hub {
    queues: Vec<mpsc::UnboundedSender<Event>>,
}

impl Hub {
    /// Must be called from within a tokio runtime (spawns one drain task
    /// per sink).
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        let mut queues = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    sink.notify(event);
                }
            });
            queues.push(tx);
        }
        Self { queues }
    }

    pub fn notify(&self, event: Event) {
        for queue in &self.queues {
            let _ = queue.send(event.clone());
        }
    }
}
