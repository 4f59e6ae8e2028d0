//! Protocol records and the typed events they carry

use crate::types::Usage;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record exactly as it appears on the wire, after the line prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Terminal job status delivered by a `status` record
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalStatus {
    Completed,
    Failed { message: Option<String> },
}

/// Typed protocol event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ThinkingStart { block_index: u32 },
    ThinkingDelta { block_index: u32, content: String },
    ThinkingSignature { block_index: u32 },
    ThinkingStop { block_index: u32 },
    TextStart,
    TextDelta { content: String },
    ToolUseStart { tool_id: String, tool_name: String },
    /// Raw fragment of the tool input (usually partial JSON)
    ToolUseDelta { content: String },
    ToolUseStop,
    ToolResult {
        tool_id: String,
        content: Value,
        is_error: bool,
    },
    Usage(Usage),
    CompactionSummary {
        content: String,
        pre_tokens: Option<u64>,
        trigger: Option<String>,
    },
    Done,
    Error { content: String },
    Keepalive,
    /// Server hint that the transport is about to be recycled
    TimeoutHint,
    Status(TerminalStatus),
    Unknown { kind: String },
}

impl Event {
    /// Whether applying this event can change the transcript or accumulator
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Event::Keepalive | Event::TimeoutHint | Event::Status(_) | Event::Unknown { .. }
        )
    }
}

/// A decoded record: ordering metadata plus its event
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub index: Option<u64>,
    pub event_id: Option<String>,
    pub conversation_id: Option<String>,
    pub event: Event,
}

impl Record {
    /// Convert a raw wire record into a typed one
    pub fn from_raw(raw: RawRecord) -> serde_json::Result<Self> {
        let meta = raw.metadata.as_ref();
        let content = raw.content.as_ref();

        let event = match raw.kind.as_str() {
            "thinking_start" => Event::ThinkingStart {
                block_index: block_index(meta),
            },
            "thinking_delta" => Event::ThinkingDelta {
                block_index: block_index(meta),
                content: content_text(content),
            },
            "thinking_signature" => Event::ThinkingSignature {
                block_index: block_index(meta),
            },
            "thinking_stop" => Event::ThinkingStop {
                block_index: block_index(meta),
            },
            "text_start" => Event::TextStart,
            "text_delta" => Event::TextDelta {
                content: content_text(content),
            },
            "tool_use_start" => Event::ToolUseStart {
                tool_id: required_str(meta, "tool_id")?,
                tool_name: meta_str(meta, "tool_name").unwrap_or_default(),
            },
            "tool_use_delta" => Event::ToolUseDelta {
                content: content_text(content),
            },
            "tool_use_stop" => Event::ToolUseStop,
            "tool_result" => Event::ToolResult {
                tool_id: required_str(meta, "tool_id")?,
                content: raw.content.clone().unwrap_or(Value::Null),
                is_error: meta
                    .and_then(|m| m.get("is_error"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "usage" => {
                let source = match (meta, content) {
                    (Some(m), _) if m.is_object() => m.clone(),
                    (_, Some(c)) if c.is_object() => c.clone(),
                    _ => return Err(serde_json::Error::custom("usage record without counters")),
                };
                Event::Usage(serde_json::from_value(source)?)
            }
            "compaction_summary" => Event::CompactionSummary {
                content: content_text(content),
                pre_tokens: meta.and_then(|m| m.get("pre_tokens")).and_then(Value::as_u64),
                trigger: meta_str(meta, "trigger"),
            },
            "done" => Event::Done,
            "error" => Event::Error {
                content: content_text(content),
            },
            "keepalive" => Event::Keepalive,
            "timeout" => Event::TimeoutHint,
            "status" => match content.and_then(Value::as_str) {
                Some("completed") => Event::Status(TerminalStatus::Completed),
                Some("failed") => Event::Status(TerminalStatus::Failed {
                    message: meta_str(meta, "error"),
                }),
                _ => Event::Unknown {
                    kind: format!("status:{}", content_text(content)),
                },
            },
            other => Event::Unknown {
                kind: other.to_string(),
            },
        };

        Ok(Self {
            index: raw.index,
            event_id: raw.event_id,
            conversation_id: raw.conversation_id,
            event,
        })
    }
}

fn block_index(meta: Option<&Value>) -> u32 {
    meta.and_then(|m| m.get("block_index"))
        .and_then(Value::as_u64)
        .map(|i| i as u32)
        .unwrap_or(0)
}

fn meta_str(meta: Option<&Value>, key: &str) -> Option<String> {
    meta.and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn required_str(meta: Option<&Value>, key: &'static str) -> serde_json::Result<String> {
    meta_str(meta, key).ok_or_else(|| serde_json::Error::missing_field(key))
}

/// Content may be a string or an object; objects are kept as their JSON text.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
