use std::io;
use std::time::Duration;

/// Failures while executing a transport command
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not configured: {0}")]
    NotConfigured(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("failed to terminate child process: {0}")]
    Kill(#[source] io::Error),

    #[error("command rejected by target: {0}")]
    Rejected(String),

    #[error("i/o error while waiting for child: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the next poll can reasonably expect a different outcome
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TimedOut(_) | Self::Cancelled | Self::Rejected(_) | Self::Io(_)
        )
    }
}
