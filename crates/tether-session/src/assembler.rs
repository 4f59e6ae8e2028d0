//! Turn assembler: a deterministic fold of protocol events onto the transcript
//!
//! The assembler owns the per-stream accumulator: several thinking blocks may
//! be open at once (keyed by the protocol's block index), while at most one
//! text block and one tool call are ever active. Turn usage is accumulated
//! here and only materialized onto a block when the turn completes.

use crate::session::Phase;
use crate::transcript::{Block, BlockKind, ToolCall, Transcript};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tether_protocol::{Event, Usage};

/// An open thinking stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingSlot {
    /// Transcript position of the visible block
    pub position: usize,
    pub buffer: String,
    /// Set by an explicit signature; unsigned slots are dropped on abort
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSlot {
    pub position: usize,
    pub buffer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSlot {
    pub position: usize,
    pub tool_id: String,
    pub buffer: String,
}

/// In-flight block state for the active stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub thinking: BTreeMap<u32, ThinkingSlot>,
    pub text: Option<TextSlot>,
    pub tool: Option<ToolSlot>,
}

/// A transcript change produced by applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockChange {
    Appended(usize),
    Updated(usize),
}

/// Outcome of applying one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    pub changes: Vec<BlockChange>,
    /// Usage attached to a block because the turn completed
    pub committed_usage: Option<Usage>,
    pub turn_completed: bool,
}

/// Serializable assembler state written to resume storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub accumulator: Accumulator,
    pub pending_results: BTreeSet<String>,
    pub turn_usage: Usage,
    pub carried_usage: Usage,
    pub turn_visible: bool,
    pub turn_complete: bool,
    pub phase_started_at: DateTime<Utc>,
}

/// Folds events into a transcript
#[derive(Debug, Clone, Default)]
pub struct TurnAssembler {
    accumulator: Accumulator,
    pending_results: BTreeSet<String>,
    turn_usage: Usage,
    /// Usage of a turn that ended without a block to carry it
    carried_usage: Usage,
    turn_visible: bool,
    turn_complete: bool,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event to the transcript
    pub fn apply(&mut self, transcript: &mut Transcript, event: &Event) -> Applied {
        let mut applied = Applied::default();

        match event {
            Event::ThinkingStart { block_index } => {
                self.begin_content();
                self.accumulator.text = None;
                if self.accumulator.thinking.contains_key(block_index) {
                    tracing::warn!("Thinking block {} reopened before stop", block_index);
                }
                let position = transcript.push(Block::live(BlockKind::Thinking {
                    content: String::new(),
                    signed: false,
                    collapsed: false,
                }));
                self.accumulator.thinking.insert(
                    *block_index,
                    ThinkingSlot {
                        position,
                        buffer: String::new(),
                        signed: false,
                    },
                );
                applied.changes.push(BlockChange::Appended(position));
            }
            Event::ThinkingDelta {
                block_index,
                content,
            } => match self.accumulator.thinking.get_mut(block_index) {
                Some(slot) => {
                    slot.buffer.push_str(content);
                    if let Some(BlockKind::Thinking { content: c, .. }) =
                        transcript.get_mut(slot.position).map(|b| &mut b.kind)
                    {
                        c.push_str(content);
                    }
                    applied.changes.push(BlockChange::Updated(slot.position));
                }
                None => tracing::warn!("Thinking delta for unopened block {}", block_index),
            },
            Event::ThinkingSignature { block_index } => {
                match self.accumulator.thinking.get_mut(block_index) {
                    Some(slot) => {
                        slot.signed = true;
                        if let Some(BlockKind::Thinking { signed, .. }) =
                            transcript.get_mut(slot.position).map(|b| &mut b.kind)
                        {
                            *signed = true;
                        }
                        applied.changes.push(BlockChange::Updated(slot.position));
                    }
                    None => {
                        tracing::warn!("Thinking signature for unopened block {}", block_index)
                    }
                }
            }
            Event::ThinkingStop { block_index } => {
                if let Some(slot) = self.accumulator.thinking.get(block_index) {
                    if set_collapsed(transcript, slot.position) {
                        applied.changes.push(BlockChange::Updated(slot.position));
                    }
                }
            }
            Event::TextStart => {
                self.begin_content();
                self.close_thinking(transcript, &mut applied.changes);
                self.close_tool(transcript, &mut applied.changes);
                self.turn_usage = std::mem::take(&mut self.carried_usage);
                let position = transcript.push(Block::live(BlockKind::Text {
                    content: String::new(),
                }));
                self.accumulator.text = Some(TextSlot {
                    position,
                    buffer: String::new(),
                });
                applied.changes.push(BlockChange::Appended(position));
            }
            Event::TextDelta { content } => match self.accumulator.text.as_mut() {
                Some(slot) => {
                    slot.buffer.push_str(content);
                    if let Some(BlockKind::Text { content: c }) =
                        transcript.get_mut(slot.position).map(|b| &mut b.kind)
                    {
                        c.push_str(content);
                    }
                    applied.changes.push(BlockChange::Updated(slot.position));
                }
                None => tracing::warn!("Text delta without an open text block"),
            },
            Event::ToolUseStart { tool_id, tool_name } => {
                self.begin_content();
                self.close_thinking(transcript, &mut applied.changes);
                self.accumulator.text = None;
                if self.accumulator.tool.is_some() {
                    tracing::warn!("Tool call {} started while another was open", tool_id);
                    self.close_tool(transcript, &mut applied.changes);
                }
                let position = transcript.push(Block::live(BlockKind::ToolCall(ToolCall {
                    tool_id: tool_id.clone(),
                    name: tool_name.clone(),
                    input: String::new(),
                    result: None,
                    is_error: false,
                    result_pending: true,
                    collapsed: false,
                })));
                self.pending_results.insert(tool_id.clone());
                self.accumulator.tool = Some(ToolSlot {
                    position,
                    tool_id: tool_id.clone(),
                    buffer: String::new(),
                });
                applied.changes.push(BlockChange::Appended(position));
            }
            Event::ToolUseDelta { content } => match self.accumulator.tool.as_mut() {
                Some(slot) => {
                    slot.buffer.push_str(content);
                    if let Some(BlockKind::ToolCall(call)) =
                        transcript.get_mut(slot.position).map(|b| &mut b.kind)
                    {
                        call.input.push_str(content);
                    }
                    applied.changes.push(BlockChange::Updated(slot.position));
                }
                None => tracing::warn!("Tool input delta without an open tool call"),
            },
            Event::ToolUseStop => {
                if self.accumulator.tool.is_none() {
                    tracing::warn!("Tool stop without an open tool call");
                }
                self.close_tool(transcript, &mut applied.changes);
            }
            Event::ToolResult {
                tool_id,
                content,
                is_error,
            } => {
                self.pending_results.remove(tool_id);
                match transcript.find_tool_call(tool_id) {
                    Some(position) => {
                        if let Some(BlockKind::ToolCall(call)) =
                            transcript.get_mut(position).map(|b| &mut b.kind)
                        {
                            call.result = Some(content.clone());
                            call.is_error = *is_error;
                            call.result_pending = false;
                        }
                        applied.changes.push(BlockChange::Updated(position));
                    }
                    None => tracing::warn!("Tool result for unknown tool call {}", tool_id),
                }
            }
            Event::Usage(usage) => {
                self.turn_usage.add(usage);
            }
            Event::CompactionSummary {
                content,
                pre_tokens,
                trigger,
            } => {
                let position = transcript.push(Block::live(BlockKind::Compaction {
                    summary: content.clone(),
                    pre_tokens: *pre_tokens,
                    trigger: trigger.clone(),
                    collapsed: true,
                }));
                applied.changes.push(BlockChange::Appended(position));
            }
            Event::Done => {
                self.finish_turn(transcript, &mut applied);
            }
            Event::Error { content } => {
                let position = transcript.push(Block::live(BlockKind::Error {
                    message: content.clone(),
                }));
                applied.changes.push(BlockChange::Appended(position));
            }
            Event::Unknown { kind } => {
                tracing::warn!("Ignoring unrecognized event type: {}", kind);
            }
            Event::Keepalive | Event::TimeoutHint | Event::Status(_) => {}
        }

        applied
    }

    fn begin_content(&mut self) {
        self.turn_visible = true;
        self.turn_complete = false;
    }

    /// Collapse every open thinking block and forget their accumulators
    fn close_thinking(&mut self, transcript: &mut Transcript, changes: &mut Vec<BlockChange>) {
        for slot in std::mem::take(&mut self.accumulator.thinking).into_values() {
            if set_collapsed(transcript, slot.position) {
                changes.push(BlockChange::Updated(slot.position));
            }
        }
    }

    /// Freeze the active tool input and free the slot
    fn close_tool(&mut self, transcript: &mut Transcript, changes: &mut Vec<BlockChange>) {
        if let Some(slot) = self.accumulator.tool.take() {
            if set_collapsed(transcript, slot.position) {
                changes.push(BlockChange::Updated(slot.position));
            }
        }
    }

    fn finish_turn(&mut self, transcript: &mut Transcript, applied: &mut Applied) {
        let usage = std::mem::take(&mut self.turn_usage);

        let target = match &self.accumulator.text {
            Some(slot) => Some(slot.position),
            None if !self.turn_visible && usage.has_cost() => {
                let position = transcript.push(Block::live(BlockKind::EmptyResponse));
                applied.changes.push(BlockChange::Appended(position));
                Some(position)
            }
            None => None,
        };

        match target {
            Some(position) if !usage.is_empty() => {
                if let Some(block) = transcript.get_mut(position) {
                    block.usage = Some(usage);
                    applied.committed_usage = Some(usage);
                    applied.changes.push(BlockChange::Updated(position));
                }
            }
            Some(_) => {}
            None if !usage.is_empty() => {
                tracing::debug!("Turn ended without a text block; carrying usage forward");
                self.carried_usage.add(&usage);
            }
            None => {}
        }

        self.accumulator.thinking.clear();
        self.accumulator.text = None;
        self.turn_visible = false;
        self.turn_complete = true;
        applied.turn_completed = true;
    }

    /// Phase implied by the accumulator
    pub fn phase(&self) -> Phase {
        if self.accumulator.tool.is_none() && !self.pending_results.is_empty() {
            Phase::ToolExecuting
        } else if self.turn_visible || self.turn_complete {
            Phase::Streaming
        } else {
            Phase::WaitingForFirstToken
        }
    }

    /// A tool call is still receiving input or awaiting results
    pub fn is_tool_busy(&self) -> bool {
        self.accumulator.tool.is_some() || !self.pending_results.is_empty()
    }

    pub fn pending_results(&self) -> &BTreeSet<String> {
        &self.pending_results
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn turn_usage(&self) -> Usage {
        self.turn_usage
    }

    pub fn turn_complete(&self) -> bool {
        self.turn_complete
    }

    /// Positions of thinking blocks that never received a signature
    pub fn unsigned_thinking_positions(&self) -> Vec<usize> {
        self.accumulator
            .thinking
            .values()
            .filter(|slot| !slot.signed)
            .map(|slot| slot.position)
            .collect()
    }

    /// Position of the active text block if nothing was written to it
    pub fn empty_text_position(&self, transcript: &Transcript) -> Option<usize> {
        let slot = self.accumulator.text.as_ref()?;
        match transcript.get(slot.position).map(|b| &b.kind) {
            Some(BlockKind::Text { content }) if content.is_empty() => Some(slot.position),
            _ => None,
        }
    }

    /// Start a new turn. Usage carried from the previous turn is kept.
    pub fn begin_turn(&mut self) {
        self.turn_usage = Usage::default();
        self.turn_visible = false;
        self.turn_complete = false;
    }

    /// Drop all accumulator and usage state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self, phase_started_at: DateTime<Utc>) -> TurnSnapshot {
        TurnSnapshot {
            accumulator: self.accumulator.clone(),
            pending_results: self.pending_results.clone(),
            turn_usage: self.turn_usage,
            carried_usage: self.carried_usage,
            turn_visible: self.turn_visible,
            turn_complete: self.turn_complete,
            phase_started_at,
        }
    }

    pub fn restore(snapshot: TurnSnapshot) -> Self {
        Self {
            accumulator: snapshot.accumulator,
            pending_results: snapshot.pending_results,
            turn_usage: snapshot.turn_usage,
            carried_usage: snapshot.carried_usage,
            turn_visible: snapshot.turn_visible,
            turn_complete: snapshot.turn_complete,
        }
    }
}

fn set_collapsed(transcript: &mut Transcript, position: usize) -> bool {
    match transcript.get_mut(position).map(|b| &mut b.kind) {
        Some(BlockKind::Thinking { collapsed, .. })
        | Some(BlockKind::Compaction { collapsed, .. }) => {
            *collapsed = true;
            true
        }
        Some(BlockKind::ToolCall(call)) => {
            call.collapsed = true;
            true
        }
        _ => false,
    }
}
