//! Stream session state: ordering cursor, phase and connection generation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the in-flight turn is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    WaitingForFirstToken,
    Streaming,
    ToolExecuting,
}

impl Phase {
    pub fn is_active(&self) -> bool {
        *self != Phase::Idle
    }
}

/// Per-conversation state of the active stream
#[derive(Debug, Clone)]
pub struct StreamSessionState {
    pub conversation_id: String,
    /// Index of the next record we expect; everything below is acknowledged
    pub next_event_index: u64,
    /// Last seen event id (diagnostics only; `next_event_index` orders records)
    pub last_event_id: Option<String>,
    pub phase: Phase,
    pub phase_changed_at: DateTime<Utc>,
    /// Bumped by every connect, abort or teardown
    pub generation: u64,
}

impl StreamSessionState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            next_event_index: 0,
            last_event_id: None,
            phase: Phase::Idle,
            phase_changed_at: Utc::now(),
            generation: 0,
        }
    }

    /// Change phase; returns true if it actually changed
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == phase {
            return false;
        }
        tracing::debug!(
            conversation = %self.conversation_id,
            "Phase {:?} -> {:?}",
            self.phase,
            phase
        );
        self.phase = phase;
        self.phase_changed_at = Utc::now();
        true
    }

    /// Record that a record was processed.
    pub fn acknowledge(&mut self, index: Option<u64>, event_id: Option<&str>) {
        if let Some(index) = index {
            self.next_event_index = self.next_event_index.max(index + 1);
        }
        if let Some(id) = event_id {
            self.last_event_id = Some(id.to_string());
        }
    }

    /// Whether a record at `index` was already applied
    pub fn is_acknowledged(&self, index: Option<u64>) -> bool {
        matches!(index, Some(i) if i < self.next_event_index)
    }

    /// Start over from the first record of the job
    pub fn rewind(&mut self) {
        self.next_event_index = 0;
        self.last_event_id = None;
    }
}
