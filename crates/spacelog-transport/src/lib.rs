//! Command transports for spacelog
//!
//! This crate runs one-shot shell commands on the host that owns the journal,
//! either over `ssh` or through a local `wsl.exe` distribution, and builds the
//! journal queries the log engine issues through them.

mod error;
mod process;
mod remote;
mod session;
mod virtualized;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use error::TransportError;
pub use process::{CommandOutput, run_child};
pub use remote::RemoteShell;
pub use session::{JournalQuery, KNOWN_JOURNALCTL_PATHS, Session, journal_size_command};
pub use virtualized::VirtualizedShell;

// Re-export types used in our public API
pub use spacelog_types::TransportKind;

/// Grace period granted to a killed child before it is reported as stuck
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(12);

/// A way of executing a shell command line on the journal host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is
    fn kind(&self) -> TransportKind;

    /// Human readable description of the target, used in status messages
    fn target(&self) -> String;

    /// Wrap a shell command line into a local process invocation
    fn command(&self, command_line: &str) -> Result<tokio::process::Command, TransportError>;

    /// How long a killed child may take to exit
    fn kill_grace(&self) -> Duration {
        DEFAULT_KILL_GRACE
    }

    /// Run a command line, killing the child on timeout or cancellation
    async fn run(
        &self,
        command_line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransportError> {
        let command = self.command(command_line)?;
        run_child(command, timeout, self.kill_grace(), cancel).await
    }

    /// Check that the target answers a trivial command
    async fn verify(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), TransportError> {
        let output = self.run("echo spacelog-ok", timeout, cancel).await?;
        if output.ok && output.stdout.contains("spacelog-ok") {
            Ok(())
        } else {
            Err(TransportError::Rejected(output.stderr.trim().to_string()))
        }
    }

    /// Hint shown to the operator when `verify` fails
    fn verify_hint(&self) -> &'static str;
}
