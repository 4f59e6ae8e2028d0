//! Core types shared by the wire layer and the session runtime

use serde::{Deserialize, Serialize};

/// Token usage and cost for a turn (or a running total)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub input: u64,
    #[serde(default, alias = "output_tokens")]
    pub output: u64,
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_write: u64,
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read: u64,
    /// Cost in dollars
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    /// Add another usage record to this one
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_write += other.cache_write;
        self.cache_read += other.cache_read;
        self.cost += other.cost;
    }

    /// Remove a previously added contribution, clamping at zero
    pub fn subtract(&mut self, other: &Usage) {
        self.input = self.input.saturating_sub(other.input);
        self.output = self.output.saturating_sub(other.output);
        self.cache_write = self.cache_write.saturating_sub(other.cache_write);
        self.cache_read = self.cache_read.saturating_sub(other.cache_read);
        self.cost = (self.cost - other.cost).max(0.0);
    }

    /// Whether any counter is non-zero
    pub fn is_empty(&self) -> bool {
        self.input == 0
            && self.output == 0
            && self.cache_write == 0
            && self.cache_read == 0
            && self.cost == 0.0
    }

    /// Whether a cost was reported
    pub fn has_cost(&self) -> bool {
        self.cost > 0.0
    }

    /// Total tokens across all counters
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output + self.cache_write + self.cache_read
    }
}

/// Result of the status probe issued before attaching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Whether a generation job is currently running for the conversation
    pub is_streaming: bool,
    /// Number of events the job has written so far
    #[serde(default)]
    pub event_count: u64,
}

/// Body of the abort call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortRequest {
    /// The backend already holds a complete record of the turn; skip resync
    pub skip_sync: bool,
}

/// Backend acknowledgement of an abort
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
