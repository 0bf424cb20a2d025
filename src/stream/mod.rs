//! Display rendering for agents that emit line-delimited JSON events.
//!
//! [`StreamParser`] turns each raw output line into zero or more display lines.
//! Token deltas are accumulated into a pending line and only emitted once a
//! newline arrives, or when [`StreamParser::flush`] is called at end of stream.

use std::fmt::Write as _;

use chrono::Local;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Longest tool-result line shown, including the trailing `...`.
pub const RESULT_PREVIEW_CHARS: usize = 120;

/// Events from the stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        hook_name: Option<String>,
    },

    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },

    StreamEvent {
        #[serde(default)]
        event: Option<DeltaEnvelope>,
    },

    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        duration_ms: Option<f64>,
        #[serde(default)]
        num_turns: Option<f64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    #[serde(other)]
    Unknown,
}

/// Content items stay raw so one malformed item does not sink its siblings.
#[derive(Debug, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },

    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },

    ToolResult {
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        output: Option<Value>,
        #[serde(default)]
        text: Option<Value>,
    },

    ServerToolUse {
        #[serde(default)]
        name: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeltaEnvelope {
    #[serde(default)]
    pub delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        #[serde(default)]
        text: String,
    },

    #[serde(other)]
    Other,
}

fn wall_clock() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Stateful translator from raw agent output to display lines.
///
/// One parser per run. The pending buffer must be flushed before the parser is
/// dropped, otherwise a trailing partial line is lost.
pub struct StreamParser {
    pending: String,
    clock: fn() -> String,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_clock(wall_clock)
    }

    /// Use a custom timestamp source instead of the local wall clock.
    pub fn with_clock(clock: fn() -> String) -> Self {
        Self {
            pending: String::new(),
            clock,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Convert one raw output line into display lines.
    pub fn parse_line(&mut self, raw: &str) -> Vec<String> {
        let line = raw.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value @ Value::Object(_)) => value,
            // Plain text, typically stderr.
            _ => return self.stamp(vec![line.to_string()]),
        };

        if value.get("type").and_then(Value::as_str).is_none() {
            debug!("ignoring stream event without a type");
            return Vec::new();
        }
        let event = match StreamEvent::deserialize(&value) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "stream event did not decode, showing it as text");
                return self.stamp(vec![line.to_string()]);
            }
        };

        let lines = match event {
            StreamEvent::StreamEvent { event } => {
                match event.and_then(|envelope| envelope.delta) {
                    Some(Delta::TextDelta { text }) => self.push_delta(&text),
                    _ => Vec::new(),
                }
            }
            StreamEvent::System {
                subtype,
                model,
                hook_name,
            } => self.flush_then(describe_system(
                subtype.as_deref(),
                model.as_deref(),
                hook_name.as_deref(),
            )),
            StreamEvent::Assistant { message } => {
                self.flush_then(describe_content(&message.content))
            }
            StreamEvent::Result {
                subtype,
                duration_ms,
                num_turns,
                total_cost_usd,
            } => self.flush_then(vec![describe_result(
                subtype.as_deref(),
                duration_ms.unwrap_or_default(),
                num_turns.unwrap_or_default(),
                total_cost_usd.unwrap_or_default(),
            )]),
            StreamEvent::Unknown => Vec::new(),
        };
        self.stamp(lines)
    }

    /// Emit the pending partial line, if any. Safe to call repeatedly.
    pub fn flush(&mut self) -> Vec<String> {
        let lines = self.take_pending();
        self.stamp(lines)
    }

    fn take_pending(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        vec![std::mem::take(&mut self.pending)]
    }

    fn flush_then(&mut self, lines: Vec<String>) -> Vec<String> {
        let mut out = self.take_pending();
        out.extend(lines);
        out
    }

    fn push_delta(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                lines.push(std::mem::take(&mut self.pending));
            } else {
                self.pending.push(ch);
            }
        }
        lines
    }

    fn stamp(&self, lines: Vec<String>) -> Vec<String> {
        if lines.is_empty() {
            return lines;
        }
        let ts = (self.clock)();
        lines
            .into_iter()
            .map(|line| {
                if line.is_empty() {
                    line
                } else {
                    format!("{ts} {line}")
                }
            })
            .collect()
    }
}

fn describe_system(
    subtype: Option<&str>,
    model: Option<&str>,
    hook_name: Option<&str>,
) -> Vec<String> {
    match subtype {
        Some("init") => match model.filter(|m| !m.is_empty()) {
            Some(model) => vec![format!("[init] model={model}")],
            None => vec!["[init]".to_string()],
        },
        Some("hook_started") => hook_name
            .filter(|name| !name.is_empty())
            .map(|name| vec![format!("[hook] {name}")])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn describe_content(items: &[Value]) -> Vec<String> {
    let mut lines = Vec::new();
    for item in items {
        let block = match ContentBlock::deserialize(item) {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "skipping malformed content item");
                continue;
            }
        };
        match &block {
            ContentBlock::Text { text } if !text.is_empty() => {
                lines.extend(text.split('\n').map(str::to_string));
            }
            ContentBlock::Text { .. } => {}
            ContentBlock::ToolUse { name, input } => lines.push(describe_tool_use(name, input)),
            ContentBlock::ToolResult {
                content,
                output,
                text,
            } => {
                let body = [content, output, text]
                    .into_iter()
                    .flatten()
                    .find_map(result_text);
                if let Some(body) = body.filter(|b| !b.is_empty()) {
                    let first = body.split('\n').next().unwrap_or_default();
                    lines.push(format!("  → {}", preview(first, RESULT_PREVIEW_CHARS)));
                }
            }
            ContentBlock::ServerToolUse { name } => lines.push(format!("[{name}]")),
            ContentBlock::Other => {}
        }
    }
    lines
}

/// Tool results carry either a bare string or a list of text blocks.
fn result_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

fn describe_result(subtype: Option<&str>, duration_ms: f64, num_turns: f64, cost: f64) -> String {
    let status = subtype.filter(|s| !s.is_empty()).unwrap_or("done");
    let mut line = format!("[result] {status}");
    if num_turns > 0.0 {
        let _ = write!(line, " | {} turns", num_turns as u64);
    }
    if duration_ms > 0.0 {
        let _ = write!(line, " | {}", format_elapsed(duration_ms / 1000.0));
    }
    if cost > 0.0 {
        let _ = write!(line, " | ${cost:.4}");
    }
    line
}

/// `12.5s` under a minute, `2m5s` from there on.
pub fn format_elapsed(secs: f64) -> String {
    let tenths = (secs * 10.0).round() / 10.0;
    if tenths < 60.0 {
        format!("{tenths:.1}s")
    } else {
        let whole = tenths as u64;
        format!("{}m{}s", whole / 60, whole % 60)
    }
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// One-line description of a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Read" | "Write" | "Edit" => format!("[{name}] {}", str_field(input, "file_path")),
        "Bash" => {
            let cmd = str_field(input, "command");
            match str_field(input, "description") {
                "" => format!("[Bash] $ {}", one_line(cmd, 100)),
                desc => format!("[Bash] {desc} $ {}", one_line(cmd, 80)),
            }
        }
        "Glob" => format!("[Glob] {}", str_field(input, "pattern")),
        "Grep" => {
            let pattern = str_field(input, "pattern");
            match str_field(input, "path") {
                "" => format!("[Grep] {pattern}"),
                path => format!("[Grep] {pattern} in {path}"),
            }
        }
        "Task" => format!("[Task] {}", str_field(input, "description")),
        "TodoWrite" => "[TodoWrite]".to_string(),
        _ => format!("[{name}]"),
    }
}

/// Flatten newlines and cap the length.
fn one_line(s: &str, max_chars: usize) -> String {
    preview(&s.replace('\n', " "), max_chars)
}

/// Truncate on a char boundary, ending in `...` when shortened.
fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}
