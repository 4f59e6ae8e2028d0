//! tether-protocol: wire layer for resumable conversation streams
//!
//! This crate decodes the prefixed, newline-delimited record stream emitted by
//! a generation job and defines the backend calls (status probe, stream open,
//! abort) a client needs to attach to that job.

pub mod backend;
pub mod decoder;
pub mod error;
pub mod record;
pub mod types;

pub use backend::{Backend, ByteStream, HttpBackend};
pub use decoder::{RECORD_PREFIX, decode_records};
pub use error::{Error, Result};
pub use record::{Event, RawRecord, Record, TerminalStatus};
pub use types::*;
