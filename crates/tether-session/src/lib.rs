//! tether-session: streaming conversation controller
//!
//! This crate attaches a client to a generation job that runs independently
//! of it, folds the job's event stream into a transcript, and keeps that
//! transcript consistent across dropped connections, reloads, background tabs
//! and user aborts.

pub mod abort;
pub mod assembler;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handle;
pub mod health;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod transcript;

pub use abort::{AbortController, AbortOutcome, AbortState};
pub use assembler::{Accumulator, TurnAssembler, TurnSnapshot};
pub use controller::{ControllerConfig, ConversationController, Outcome};
pub use coordinator::{RetryPolicy, StreamCoordinator};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use handle::SessionHandle;
pub use health::{HealthConfig, HealthMonitor, Visibility};
pub use reconcile::Strategy;
pub use session::{Phase, StreamSessionState};
pub use store::{FileStore, KeyValueStore, MemoryStore, ResumeStorage};
pub use transcript::{Block, BlockKind, Origin, ToolCall, Transcript};
