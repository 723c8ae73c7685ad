pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod models;
pub mod normalizer;
pub mod relay;
pub mod session;

// Re-export the main error types for convenience
pub use error::{RelayError, RelayResult};

// Re-export event models and the normalizer
pub use models::{
    CanonicalEvent, EventKind, GiftDetails, Inbound, OutboundMessage, RawEvent, RawPayload,
};
pub use normalizer::normalize;

// Re-export I/O utilities for convenience
pub use io::ndjson::{parse_event_line, TimestampedEntry};
pub use io::source::{replay_into, EventSource, NdjsonFileSource, ReaderSource, ReplaySummary};

// Re-export the engine surface
pub use analytics::{Tier, TierAssignment};
pub use config::{AppConfig, ConfigManager, EngineConfig};
pub use relay::{Broadcaster, RecordingBroadcaster, RelayEngine, RelayHandle, TierSnapshot};
pub use session::{EndReason, SessionContext, SessionRegistry, SessionState, SessionStats};
