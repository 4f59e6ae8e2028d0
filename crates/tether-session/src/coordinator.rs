//! Stream coordinator: connection lifecycle, disconnect classification, retry
//!
//! Every connection attempt runs under a generation number. Anything that
//! finishes under a generation other than the current one is discarded, so
//! two overlapping attempts can never both write the transcript.

use crate::error::Error;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tether_protocol::TerminalStatus;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed while the job has not started writing
    pub startup_max_attempts: u32,
    /// Fixed delay between startup attempts
    pub startup_delay: Duration,
    /// Consecutive network failures allowed
    pub network_max_attempts: u32,
    /// Initial delay between network retries
    pub initial_delay: Duration,
    /// Maximum delay between network retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            startup_max_attempts: 15,
            startup_delay: Duration::from_millis(500),
            network_max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given network retry (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Shared, monotonically increasing connection generation
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter(Arc<AtomicU64>);

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate everything running under the current generation
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a connection ended
#[derive(Debug)]
pub enum DisconnectCause {
    /// The job has not begun writing its stream yet
    StartupNotFound,
    /// The server announced it is recycling the transport
    TimeoutHint,
    /// Re-attach after a status probe, e.g. when a hidden tab comes back
    Resync,
    /// Network or transport failure
    Transport(String),
    /// The health monitor saw no traffic for too long
    Stalled,
    /// The stream closed before the turn finished
    UnexpectedEnd,
    /// Explicit terminal status from the job
    Terminal(TerminalStatus),
    /// Non-retryable failure
    Fatal(Error),
}

impl DisconnectCause {
    /// Classify a failure to open the stream
    pub fn from_open_error(error: tether_protocol::Error) -> Self {
        if error.is_not_found() {
            DisconnectCause::StartupNotFound
        } else if error.is_retryable() {
            DisconnectCause::Transport(error.to_string())
        } else {
            DisconnectCause::Fatal(Error::Protocol(error))
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DisconnectCause::StartupNotFound => "startup",
            DisconnectCause::TimeoutHint => "timeout",
            DisconnectCause::Resync => "resync",
            DisconnectCause::Transport(_) => "transport",
            DisconnectCause::Stalled => "stalled",
            DisconnectCause::UnexpectedEnd => "closed",
            DisconnectCause::Terminal(_) => "terminal",
            DisconnectCause::Fatal(_) => "fatal",
        }
    }
}

/// What to do after a disconnect
#[derive(Debug)]
pub enum RetryDecision {
    Reconnect {
        from_index: u64,
        delay: Duration,
        attempt: u32,
    },
    /// Turn finished normally
    Finish,
    Fail(Error),
}

/// Connection lifecycle and retry budgets for one conversation
#[derive(Debug)]
pub struct StreamCoordinator {
    policy: RetryPolicy,
    generation: GenerationCounter,
    state: LinkState,
    startup_attempts: u32,
    network_attempts: u32,
}

impl StreamCoordinator {
    pub fn new(policy: RetryPolicy, generation: GenerationCounter) -> Self {
        Self {
            policy,
            generation,
            state: LinkState::Disconnected,
            startup_attempts: 0,
            network_attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start a connection attempt under a fresh generation
    pub fn begin(&mut self, conversation_id: &str, from_index: u64) -> u64 {
        let generation = self.generation.advance();
        self.state = LinkState::Connecting;
        tracing::debug!(
            conversation = %conversation_id,
            generation,
            from_index,
            "Connecting"
        );
        generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.is_current(generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    /// First bytes arrived for `generation`
    pub fn mark_connected(&mut self, generation: u64) {
        if self.is_current(generation) && self.state == LinkState::Connecting {
            self.state = LinkState::Connected;
        }
    }

    /// A record was applied; the connection is making progress
    pub fn on_progress(&mut self) {
        self.startup_attempts = 0;
        self.network_attempts = 0;
    }

    /// Clear retry budgets for a new turn
    pub fn reset_budgets(&mut self) {
        self.on_progress();
    }

    /// Tear down: invalidate the current generation (and any pending retry)
    pub fn teardown(&mut self) {
        self.generation.advance();
        self.state = LinkState::Disconnected;
    }

    /// Decide how to continue after the connection ended
    pub fn on_disconnect(&mut self, cause: DisconnectCause, next_index: u64) -> RetryDecision {
        self.state = LinkState::Disconnected;

        match cause {
            DisconnectCause::StartupNotFound => {
                self.startup_attempts += 1;
                if self.startup_attempts > self.policy.startup_max_attempts {
                    return RetryDecision::Fail(Error::StartupTimedOut {
                        attempts: self.startup_attempts - 1,
                    });
                }
                // The job may not have existed when we last asked; start over
                RetryDecision::Reconnect {
                    from_index: 0,
                    delay: self.policy.startup_delay,
                    attempt: self.startup_attempts,
                }
            }
            DisconnectCause::TimeoutHint | DisconnectCause::Resync => RetryDecision::Reconnect {
                from_index: next_index,
                delay: Duration::ZERO,
                attempt: 0,
            },
            DisconnectCause::Transport(message) => self.network_retry(message, next_index),
            DisconnectCause::Stalled => self.network_retry("stalled".to_string(), next_index),
            DisconnectCause::UnexpectedEnd => {
                self.network_retry("stream closed".to_string(), next_index)
            }
            DisconnectCause::Terminal(TerminalStatus::Completed) => RetryDecision::Finish,
            DisconnectCause::Terminal(TerminalStatus::Failed { message }) => RetryDecision::Fail(
                Error::JobFailed(message.unwrap_or_else(|| "generation failed".to_string())),
            ),
            DisconnectCause::Fatal(error) => RetryDecision::Fail(error),
        }
    }
}

impl StreamCoordinator {
    fn network_retry(&mut self, last_error: String, next_index: u64) -> RetryDecision {
        self.network_attempts += 1;
        if self.network_attempts > self.policy.network_max_attempts {
            return RetryDecision::Fail(Error::RetriesExhausted {
                attempts: self.network_attempts - 1,
                last_error,
            });
        }
        let delay = self.policy.delay_for_attempt(self.network_attempts - 1);
        tracing::warn!(
            "Stream disconnected (attempt {}/{}): {}. Retrying in {:?}...",
            self.network_attempts,
            self.policy.network_max_attempts,
            last_error,
            delay
        );
        RetryDecision::Reconnect {
            from_index: next_index,
            delay,
            attempt: self.network_attempts,
        }
    }
}
