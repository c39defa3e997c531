//! Shared types for spacelog
//!
//! This crate contains data structures used across multiple spacelog crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Stream Types
// ============================================================================

/// One of the two independently polled journal streams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Service-level output of the SpacetimeDB server
    ModuleLog,
    /// Per-module output routed through the retargetable logs service
    DatabaseLog,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::ModuleLog, StreamKind::DatabaseLog];

    /// Key used by the persistence layer for this stream
    pub fn storage_key(&self) -> &'static str {
        match self {
            Self::ModuleLog => "module_log",
            Self::DatabaseLog => "database_log",
        }
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            Self::ModuleLog => "module",
            Self::DatabaseLog => "db",
        }
    }

    /// Marker inserted after the canonical timestamp for error records
    pub fn error_marker(&self) -> &'static str {
        match self {
            Self::ModuleLog => " [ERROR]",
            Self::DatabaseLog => " [DATABASE LOG ERROR]",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Severity of an operator-visible status message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

// ============================================================================
// Transport Types
// ============================================================================

/// How commands reach the host running the journal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// `ssh` to a remote machine
    Remote,
    /// `wsl.exe` into a local distribution
    Virtualized,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Virtualized => f.write_str("wsl"),
        }
    }
}

// ============================================================================
// Persisted State
// ============================================================================

/// Durable per-stream state, written by the state store
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    /// Live buffer content
    pub buffer: String,

    /// Buffer content as last handed to consumers
    #[serde(default)]
    pub cached_buffer: String,

    /// Exclusive lower bound for the next journal query
    pub cursor: Option<DateTime<Utc>>,

    /// Whether records older than `fresh_start_epoch` are suppressed
    #[serde(default)]
    pub fresh_start: bool,

    pub fresh_start_epoch: Option<DateTime<Utc>>,
}

// ============================================================================
// Canonical Lines
// ============================================================================

/// strftime layout of the bracketed canonical timestamp
pub const CANONICAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Marker prepended to a buffer after front truncation
pub const TRUNCATION_MARKER: &str = "[... Log Truncated ...]";

/// Format a timestamp as `[YYYY-MM-DD HH:MM:SS]`
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    format!("[{}]", ts.format(CANONICAL_TIME_FORMAT))
}

/// Build a canonical line from its parts
pub fn canonical_line(ts: DateTime<Utc>, marker: &str, message: &str) -> String {
    format!("{}{} {}", canonical_timestamp(ts), marker, message)
}
