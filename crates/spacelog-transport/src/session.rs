//! Journal session on top of a transport
//!
//! The session owns the transport for the lifetime of the engine and resolves
//! the `journalctl` binary once. Everything in here is read-only after that
//! first resolution and shared by all stream pollers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CommandOutput, Transport, TransportError, TransportKind};

/// Install locations probed when `journalctl` is not on the login PATH
pub const KNOWN_JOURNALCTL_PATHS: &[&str] = &[
    "/usr/bin/journalctl",
    "/bin/journalctl",
    "/usr/local/bin/journalctl",
    "/usr/lib/systemd/journalctl",
];

const FALLBACK_JOURNALCTL: &str = "journalctl";

/// Shared handle to the journal host
pub struct Session {
    transport: Arc<dyn Transport>,
    journalctl: OnceCell<String>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            journalctl: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn target(&self) -> String {
        self.transport.target()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run an arbitrary command line on the host
    pub async fn run(
        &self,
        command_line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransportError> {
        self.transport.run(command_line, timeout, cancel).await
    }

    /// Path of `journalctl` on the host, resolved on first use.
    ///
    /// When the host answers without a usable path the bare binary name is
    /// cached and not retried within the session. A resolution that was
    /// cancelled or timed out caches nothing; that call uses the bare name and
    /// the next one asks the host again.
    pub async fn journalctl(&self, timeout: Duration, cancel: &CancellationToken) -> &str {
        let resolved = self
            .journalctl
            .get_or_try_init(|| async {
                match self.transport.run(&resolve_script(), timeout, cancel).await {
                    Ok(output) => match parse_resolved_path(&output.stdout) {
                        Some(path) => {
                            info!(target_host = %self.target(), %path, "resolved journalctl");
                            Ok(path)
                        }
                        None => {
                            warn!(stderr = %output.stderr.trim(), "journalctl not found, using PATH lookup");
                            Ok(FALLBACK_JOURNALCTL.to_string())
                        }
                    },
                    Err(e @ (TransportError::Cancelled | TransportError::TimedOut(_))) => Err(e),
                    Err(e) => {
                        warn!(error = %e, "journalctl resolution failed, using PATH lookup");
                        Ok(FALLBACK_JOURNALCTL.to_string())
                    }
                }
            })
            .await;

        match resolved {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "journalctl resolution interrupted, retrying on next use");
                FALLBACK_JOURNALCTL
            }
        }
    }

    /// Size in bytes of everything the journal holds for `unit`
    pub async fn journal_size_bytes(
        &self,
        unit: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, TransportError> {
        let binary = self.journalctl(timeout, cancel).await.to_string();
        let output = self
            .run(&journal_size_command(&binary, unit), timeout, cancel)
            .await?;
        let size = output.stdout.trim().parse::<u64>().ok();
        debug!(%unit, ?size, "journal size");
        Ok(size)
    }
}

/// Shell snippet printing the first usable `journalctl` path
fn resolve_script() -> String {
    let candidates = KNOWN_JOURNALCTL_PATHS.join(" ");
    format!(
        "command -v journalctl 2>/dev/null || \
         for p in {candidates}; do [ -x \"$p\" ] && echo \"$p\" && break; done"
    )
}

fn parse_resolved_path(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('/'))
        .map(str::to_string)
}

/// Command line measuring the journal size of a unit
pub fn journal_size_command(binary: &str, unit: &str) -> String {
    format!("{binary} -u {unit} --output=short-iso -q | wc -c")
}

/// An incremental journal query for one unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalQuery {
    pub binary: String,
    pub unit: String,
    pub since: DateTime<Utc>,
}

impl JournalQuery {
    pub fn new(binary: impl Into<String>, unit: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            binary: binary.into(),
            unit: unit.into(),
            since,
        }
    }

    /// Value passed to `--since`, microsecond precision in UTC
    pub fn since_arg(&self) -> String {
        self.since.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string()
    }

    pub fn command_line(&self) -> String {
        format!(
            "{} -u {} --since '{}' --no-pager --output=short-iso-precise -q",
            self.binary,
            self.unit,
            self.since_arg()
        )
    }
}
