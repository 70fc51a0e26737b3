//! Parsing of the agent CLI's stream-json output (one JSON object per
//! line).

use serde::Deserialize;
use serde_json::Value;

/// A single line of stream-json output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Startup and housekeeping events. `subtype == "init"` carries the
    /// agent's own session id, used for `--resume`.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: String,
    },
    /// Streaming assistant content.
    Assistant { message: AssistantMessage },
    /// Final summary of the run.
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        duration_ms: i64,
        #[serde(default)]
        num_turns: i64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Parse one line. Empty lines yield `Ok(None)`; malformed JSON is an error
/// the caller logs and skips, never an abort of the stream.
pub fn parse_stream_line(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Human-readable progress hint from an assistant event: the first text
/// block truncated to 200 chars, or the tool being invoked.
pub fn extract_progress(message: &AssistantMessage) -> Option<String> {
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => return Some(truncate(text, 200)),
            ContentBlock::ToolUse { name, .. } => return Some(format!("Using tool: {name}")),
            ContentBlock::Other => {}
        }
    }
    None
}

/// All text content of an assistant event, concatenated.
pub fn extract_output(message: &AssistantMessage) -> String {
    let mut out = String::new();
    for block in &message.content {
        if let ContentBlock::Text { text } = block {
            out.push_str(text);
        }
    }
    out
}

/// Truncate to at most `max` bytes on a char boundary, appending `...`
/// when anything was cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
