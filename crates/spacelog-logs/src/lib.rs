//! Journal polling for spacelog
//!
//! This crate turns incremental `journalctl` queries into two bounded,
//! deduplicated, persisted log buffers: one for the SpacetimeDB server
//! itself and one for the database log of the selected module.

mod buffer;
mod config;
mod cursor;
mod engine;
mod events;
mod filter;
mod parser;
mod queue;
mod store;
mod stream;

#[cfg(test)]
mod testing;

pub use buffer::LogBuffer;
pub use config::{BufferLimits, EngineConfig, SchedulingMode};
pub use cursor::StreamCursor;
pub use engine::{JournalSizes, LogEngine, ModuleSettings};
pub use events::{EngineEvent, EngineObserver, dispatch_events};
pub use filter::NoiseFilter;
pub use parser::{LineNormalizer, NormalizeContext, ParsedRecord};
pub use queue::RateLimitedQueue;
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError};
pub use stream::PollOutcome;

// Re-export types used in our public API
pub use spacelog_types::{Severity, StreamKind, StreamSnapshot};
