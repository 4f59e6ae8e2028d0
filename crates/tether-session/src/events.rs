//! Session event types

use crate::reconcile::Strategy;
use crate::session::Phase;
use crate::transcript::Block;
use serde::{Deserialize, Serialize};

/// Events published while a conversation streams.
///
/// Block events carry the block as it looks after the change, so renderers on
/// another task never need to borrow the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    BlockAppended { position: usize, block: Block },
    BlockUpdated { position: usize, block: Block },
    /// Blocks were removed; positions after the first removal shifted
    TranscriptRewritten { len: usize },
    PhaseChanged { phase: Phase },
    HealthChanged { healthy: bool },
    Reconnecting {
        cause: String,
        attempt: u32,
        delay_ms: u64,
    },
    Reconciled { strategy: Strategy },
    Completed,
    Failed { message: String },
    Aborted,
}

impl SessionEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Completed | SessionEvent::Failed { .. } | SessionEvent::Aborted
        )
    }
}
