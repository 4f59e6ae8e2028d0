//! Abort controller
//!
//! An abort that arrives while a tool call is still streaming its input, or
//! while tool results are outstanding, is deferred until the tool side of the
//! turn settles. Executing it trims half-written blocks and marks the turn
//! interrupted.

use crate::assembler::TurnAssembler;
use crate::transcript::{Block, BlockKind, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortState {
    Running,
    AbortRequested,
    /// Waiting for the active tool call to close and its results to arrive
    AbortPending,
    Aborting,
    Aborted,
}

/// Result of executing an abort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    /// Number of unfinished blocks removed from the transcript
    pub removed: usize,
    /// Position of the appended `Interrupted` block
    pub interrupted_at: usize,
    /// The backend already holds a complete record of the turn
    pub skip_sync: bool,
}

#[derive(Debug, Clone)]
pub struct AbortController {
    state: AbortState,
    deferred: bool,
}

impl Default for AbortController {
    fn default() -> Self {
        Self {
            state: AbortState::Running,
            deferred: false,
        }
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AbortState {
        self.state
    }

    /// Request an abort. Returns the resulting state: `Aborting` means execute
    /// now, `AbortPending` means wait for [`AbortController::poll`].
    pub fn request(&mut self, assembler: &TurnAssembler) -> AbortState {
        if self.state != AbortState::Running {
            return self.state;
        }
        self.state = AbortState::AbortRequested;

        if assembler.is_tool_busy() {
            tracing::info!(
                pending = assembler.pending_results().len(),
                "Deferring abort until tool call settles"
            );
            self.deferred = true;
            self.state = AbortState::AbortPending;
        } else {
            self.state = AbortState::Aborting;
        }
        self.state
    }

    /// Check a pending abort after each applied event; true once it should run
    pub fn poll(&mut self, assembler: &TurnAssembler) -> bool {
        if self.state == AbortState::AbortPending && !assembler.is_tool_busy() {
            self.state = AbortState::Aborting;
            return true;
        }
        false
    }

    /// Trim unfinished blocks, append `Interrupted` and reset the assembler
    pub fn execute(
        &mut self,
        transcript: &mut Transcript,
        assembler: &mut TurnAssembler,
    ) -> AbortOutcome {
        let mut doomed = assembler.unsigned_thinking_positions();
        if let Some(position) = assembler.empty_text_position(transcript) {
            doomed.push(position);
        }
        let removed = transcript.remove_positions(&doomed).len();
        let interrupted_at = transcript.push(Block::live(BlockKind::Interrupted));
        assembler.reset();

        let skip_sync = self.deferred;
        self.deferred = false;
        self.state = AbortState::Aborted;

        tracing::debug!(removed, skip_sync, "Abort executed");
        AbortOutcome {
            removed,
            interrupted_at,
            skip_sync,
        }
    }

    /// Ready for the next turn
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
