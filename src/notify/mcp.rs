//! MCP notification sink.
//!
//! Converts task events into MCP notifications and pushes them through a
//! narrow sender interface (implemented by the MCP session registry, which
//! keeps this module free of any dependency on the HTTP layer):
//!
//! - `task.progress` → `notifications/progress` with
//!   `{progressToken, message}`, debounced per task.
//! - everything else → `notifications/message` with the task payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::{Event, EventKind, Notifier};

/// Delivery interface into the MCP transport.
pub trait NotificationSender: Send + Sync {
    fn send_to_session(&self, session_id: &str, method: &str, params: Value);
    fn send_to_all(&self, method: &str, params: Value);
}

pub struct McpNotifier {
    sender: Arc<dyn NotificationSender>,
    window: Duration,
    /// Last delivered progress per task id.
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl McpNotifier {
    pub fn new(sender: Arc<dyn NotificationSender>, window: Duration) -> Self {
        Self {
            sender,
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when the event should be dropped (progress within the
    /// debounce window). Terminal events clear the task's entry.
    fn admit(&self, event: &Event) -> bool {
        let mut last = self.last_sent.lock().expect("debounce lock");
        match event.kind {
            EventKind::Progress => {
                let now = Instant::now();
                if let Some(prev) = last.get(&event.task_id) {
                    if now.duration_since(*prev) < self.window {
                        return false;
                    }
                }
                last.insert(event.task_id.clone(), now);
                true
            }
            kind if kind.is_terminal() => {
                last.remove(&event.task_id);
                true
            }
            _ => true,
        }
    }

    fn deliver(&self, event: &Event, method: &str, params: Value) {
        if event.mcp_session_id.is_empty() {
            self.sender.send_to_all(method, params);
        } else {
            self.sender
                .send_to_session(&event.mcp_session_id, method, params);
        }
    }
}

impl Notifier for McpNotifier {
    fn notify(&self, event: Event) {
        if !self.admit(&event) {
            return;
        }

        match event.kind {
            EventKind::Progress => {
                let params = json!({
                    "progressToken": event.task_id,
                    "message": event.message,
                });
                self.deliver(&event, "notifications/progress", params);
            }
            _ => {
                let params = json!({
                    "level": "info",
                    "data": {
                        "event": event.kind.as_str(),
                        "task_id": event.task_id,
                        "project": event.project,
                        "message": event.message,
                    },
                });
                self.deliver(&event, "notifications/message", params);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Sent {
        session_id: String,
        method: String,
        params: Value,
    }

    #[derive(Default)]
    struct MockSender {
        targeted: Mutex<Vec<Sent>>,
        broadcast: Mutex<Vec<Sent>>,
    }

    impl NotificationSender for MockSender {
        fn send_to_session(&self, session_id: &str, method: &str, params: Value) {
            self.targeted.lock().unwrap().push(Sent {
                session_id: session_id.to_string(),
                method: method.to_string(),
                params,
            });
        }

        fn send_to_all(&self, method: &str, params: Value) {
            self.broadcast.lock().unwrap().push(Sent {
                session_id: String::new(),
                method: method.to_string(),
                params,
            });
        }
    }

    fn notifier(window_ms: u64) -> (Arc<MockSender>, McpNotifier) {
        let sender = Arc::new(MockSender::default());
        let n = McpNotifier::new(sender.clone(), Duration::from_millis(window_ms));
        (sender, n)
    }

    fn progress(task_id: &str, msg: &str) -> Event {
        Event::new(EventKind::Progress, task_id, "demo", msg)
    }

    #[test]
    fn progress_debounce() {
        let (sender, n) = notifier(100);

        n.notify(progress("t1", "step 1"));
        assert_eq!(sender.broadcast.lock().unwrap().len(), 1);

        // Rapid second event inside the window is dropped.
        n.notify(progress("t1", "step 2"));
        assert_eq!(sender.broadcast.lock().unwrap().len(), 1);

        std::thread::sleep(Duration::from_millis(120));
        n.notify(progress("t1", "step 3"));
        assert_eq!(sender.broadcast.lock().unwrap().len(), 2);
    }

    #[test]
    fn terminal_events_bypass_debounce() {
        for kind in [EventKind::Completed, EventKind::Failed, EventKind::Cancelled] {
            let (sender, n) = notifier(10_000);
            n.notify(progress("t1", "working"));
            n.notify(Event::new(kind, "t1", "demo", "done"));
            assert_eq!(
                sender.broadcast.lock().unwrap().len(),
                2,
                "terminal event {kind:?} must not be debounced"
            );
        }
    }

    #[test]
    fn started_always_sent() {
        let (sender, n) = notifier(10_000);
        n.notify(Event::new(EventKind::Started, "t1", "demo", "PID 42"));
        let sent = sender.broadcast.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "notifications/message");
    }

    #[test]
    fn targets_specific_session() {
        let (sender, n) = notifier(50);
        let mut e = Event::new(EventKind::Completed, "t1", "myproj", "done");
        e.mcp_session_id = "sess-abc".into();
        n.notify(e);

        assert_eq!(sender.broadcast.lock().unwrap().len(), 0);
        let targeted = sender.targeted.lock().unwrap();
        assert_eq!(targeted.len(), 1);
        assert_eq!(targeted[0].session_id, "sess-abc");
        assert_eq!(targeted[0].method, "notifications/message");
        let data = &targeted[0].params["data"];
        assert_eq!(data["task_id"], "t1");
        assert_eq!(data["project"], "myproj");
    }

    #[test]
    fn broadcasts_when_no_session() {
        let (sender, n) = notifier(50);
        n.notify(Event::new(EventKind::Completed, "t1", "demo", "done"));
        assert_eq!(sender.targeted.lock().unwrap().len(), 0);
        assert_eq!(sender.broadcast.lock().unwrap().len(), 1);
    }

    #[test]
    fn progress_method_and_params() {
        let (sender, n) = notifier(50);
        n.notify(progress("t1", "compiling..."));
        let sent = sender.broadcast.lock().unwrap();
        assert_eq!(sent[0].method, "notifications/progress");
        assert_eq!(sent[0].params["progressToken"], "t1");
        assert_eq!(sent[0].params["message"], "compiling...");
    }

    #[test]
    fn completed_clears_debounce_entry() {
        let (_, n) = notifier(10_000);
        n.notify(progress("t1", "step 1"));
        n.notify(Event::new(EventKind::Completed, "t1", "demo", "done"));
        assert!(!n.last_sent.lock().unwrap().contains_key("t1"));
    }

    #[test]
    fn tasks_debounce_independently() {
        let (sender, n) = notifier(100);
        n.notify(progress("t1", "t1 step 1"));
        n.notify(progress("t2", "t2 step 1"));
        assert_eq!(sender.broadcast.lock().unwrap().len(), 2);

        n.notify(progress("t1", "t1 step 2"));
        assert_eq!(sender.broadcast.lock().unwrap().len(), 2);
    }
}
