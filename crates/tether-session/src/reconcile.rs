//! Reconciliation: choosing how to rejoin a generation job that is still running
//!
//! Three situations look the same from the outside (a job is streaming and we
//! are not attached) but need different transcript surgery:
//!
//! - after a hard reload only persisted blocks are in memory, so the in-flight
//!   turn is stripped and replayed from index 0;
//! - after a timeout or a tab coming back, live blocks are still in memory, so
//!   the accumulator is restored and the stream continues where it stopped;
//! - with no active job, resume state is cleared and the transcript is final.

use crate::assembler::TurnAssembler;
use crate::transcript::{Block, Transcript};
use serde::{Deserialize, Serialize};
use tether_protocol::{JobStatus, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FullReplay,
    Resume,
    NoActiveJob,
}

/// Pick the reconciliation strategy for a status probe result
pub fn classify(status: &JobStatus, transcript: &Transcript) -> Strategy {
    if !status.is_streaming {
        Strategy::NoActiveJob
    } else if transcript.has_live_blocks() {
        Strategy::Resume
    } else {
        Strategy::FullReplay
    }
}

/// What a full replay removed
#[derive(Debug, Clone, Default)]
pub struct Stripped {
    pub blocks: Vec<Block>,
    /// Usage those blocks contributed to running totals
    pub usage: Usage,
}

/// Prepare for a replay from index 0: reset the assembler, strip the
/// in-progress turn and take its usage back out of `totals`.
pub fn prepare_full_replay(
    transcript: &mut Transcript,
    assembler: &mut TurnAssembler,
    totals: &mut Usage,
) -> Stripped {
    assembler.reset();
    let blocks = transcript.strip_after_last_user();
    let usage = Transcript::usage_of(&blocks);
    totals.subtract(&usage);
    tracing::debug!(
        stripped = blocks.len(),
        tokens = usage.total_tokens(),
        "Prepared full replay"
    );
    Stripped { blocks, usage }
}

/// Tracks whether local health can be trusted to skip a status probe
#[derive(Debug, Clone, Default)]
pub struct ReprobeGuard {
    backgrounded_while_streaming: bool,
}

impl ReprobeGuard {
    /// Note that the page went to the background
    pub fn on_background(&mut self, streaming: bool) {
        if streaming {
            self.backgrounded_while_streaming = true;
        }
    }

    /// Whether the server must be probed before trusting the connection.
    ///
    /// Background throttling makes the health flag unreliable, so a tab that
    /// was hidden mid-stream always probes.
    pub fn needs_probe(&self, healthy: bool, connected: bool) -> bool {
        self.backgrounded_while_streaming || !healthy || !connected
    }

    pub fn was_backgrounded_while_streaming(&self) -> bool {
        self.backgrounded_while_streaming
    }

    pub fn clear(&mut self) {
        self.backgrounded_while_streaming = false;
    }
}
