//! I/O utilities for recorded event streams.
//!
//! Recorded streams are NDJSON files (one raw event per line) that are
//! replayed through an [`EventSource`].

pub mod ndjson;
pub mod source;

// Re-export commonly used types and functions
pub use ndjson::{parse_event_line, TimestampedEntry};
pub use source::{
    replay_into, EventSource, NdjsonFileSource, ReaderSource, ReplayClock, ReplaySummary, VecSource,
};
