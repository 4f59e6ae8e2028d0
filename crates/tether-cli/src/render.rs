//! Plain-text rendering of session events

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use tether_protocol::Usage;
use tether_session::{Block, BlockKind, SessionEvent, ToolCall, Transcript};

/// Prints only what each event adds to the terminal
#[derive(Debug, Default)]
pub struct Renderer {
    /// Bytes of each block's body already printed
    printed: HashMap<usize, usize>,
    /// Tool calls whose result was printed
    tool_results: HashSet<usize>,
    current: Option<usize>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output for one event, if it has anything to show
    pub fn render(&mut self, event: &SessionEvent) -> Option<String> {
        match event {
            SessionEvent::BlockAppended { position, block }
            | SessionEvent::BlockUpdated { position, block } => self.render_block(*position, block),
            SessionEvent::TranscriptRewritten { .. } => {
                self.printed.clear();
                self.tool_results.clear();
                self.current = None;
                None
            }
            SessionEvent::Reconnecting {
                cause,
                attempt,
                delay_ms,
            } => Some(format!(
                "\n[reconnecting: {} (attempt {}, {}ms)]",
                cause, attempt, delay_ms
            )),
            SessionEvent::HealthChanged { healthy: false } => {
                Some("\n[connection stalled]".to_string())
            }
            SessionEvent::Reconciled { strategy } => Some(format!("[reconciled: {:?}]\n", strategy)),
            SessionEvent::Failed { message } => Some(format!("\n[failed: {}]\n", message)),
            SessionEvent::Aborted => Some("\n[aborted]\n".to_string()),
            _ => None,
        }
    }

    fn render_block(&mut self, position: usize, block: &Block) -> Option<String> {
        let (label, body) = match &block.kind {
            BlockKind::Text { content } => (None, content.as_str()),
            BlockKind::Thinking { content, .. } => (Some("thinking"), content.as_str()),
            BlockKind::ToolCall(call) => return self.render_tool(position, call),
            BlockKind::User { text } => (Some("you"), text.as_str()),
            BlockKind::System { content } => (Some("system"), content.as_str()),
            BlockKind::Compaction { summary, .. } => (Some("compacted"), summary.as_str()),
            BlockKind::Error { message } => (Some("error"), message.as_str()),
            BlockKind::Interrupted => (Some("interrupted"), ""),
            BlockKind::EmptyResponse => (Some("empty response"), ""),
        };

        let seen = self.printed.get(&position).copied();
        let mut out = String::new();
        if seen.is_none() || self.current != Some(position) {
            if self.current.is_some() {
                out.push('\n');
            }
            if let Some(label) = label {
                let _ = write!(out, "[{}] ", label);
            }
        }
        out.push_str(body.get(seen.unwrap_or(0)..).unwrap_or(""));

        self.printed.insert(position, body.len());
        self.current = Some(position);
        if out.is_empty() { None } else { Some(out) }
    }

    fn render_tool(&mut self, position: usize, call: &ToolCall) -> Option<String> {
        let mut out = String::new();
        if !self.printed.contains_key(&position) {
            let _ = write!(out, "\n[tool {}]", call.name);
            self.printed.insert(position, 0);
        }
        if let Some(result) = &call.result {
            if self.tool_results.insert(position) {
                let text = match result {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let status = if call.is_error { "failed" } else { "done" };
                let _ = write!(out, "\n[{} {}: {}]", call.name, status, truncate_chars(&text, 200));
            }
        }
        self.current = Some(position);
        if out.is_empty() { None } else { Some(out) }
    }
}

/// One-paragraph description of a finished transcript
pub fn summary(transcript: &Transcript, totals: &Usage) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for block in transcript.blocks() {
        *counts.entry(kind_name(&block.kind)).or_default() += 1;
    }
    let kinds: Vec<String> = counts
        .iter()
        .map(|(name, n)| format!("{} {}", n, name))
        .collect();

    format!(
        "{} blocks ({})\ntokens: {} in, {} out, {} cache read, {} cache write | cost ${:.4}",
        transcript.len(),
        kinds.join(", "),
        totals.input,
        totals.output,
        totals.cache_read,
        totals.cache_write,
        totals.cost
    )
}

fn kind_name(kind: &BlockKind) -> &'static str {
    match kind {
        BlockKind::User { .. } => "user",
        BlockKind::Text { .. } => "text",
        BlockKind::Thinking { .. } => "thinking",
        BlockKind::ToolCall(_) => "tool",
        BlockKind::System { .. } => "system",
        BlockKind::Compaction { .. } => "compaction",
        BlockKind::Interrupted => "interrupted",
        BlockKind::Error { .. } => "error",
        BlockKind::EmptyResponse => "empty",
    }
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
