use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransportError;

/// Captured result of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,

    /// Whether the command exited successfully
    pub ok: bool,

    /// Exit code, if the process exited normally
    pub code: Option<i32>,
}

enum Exit {
    Finished(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `command`, capture its output and enforce `timeout`.
///
/// The child is always reaped: on timeout or cancellation it is killed and
/// waited for up to `kill_grace`. A child that survives the kill is reported
/// as [`TransportError::Kill`].
pub async fn run_child(
    mut command: Command,
    timeout: Duration,
    kill_grace: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, TransportError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
    let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

    let started = Instant::now();
    let exit = tokio::select! {
        status = child.wait() => Exit::Finished(status),
        _ = tokio::time::sleep(timeout) => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    let status = match exit {
        Exit::Finished(status) => status?,
        Exit::TimedOut => {
            warn!(%program, timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            terminate(&mut child, kill_grace).await?;
            return Err(TransportError::TimedOut(timeout));
        }
        Exit::Cancelled => {
            debug!(%program, "command cancelled, killing");
            terminate(&mut child, kill_grace).await?;
            return Err(TransportError::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    debug!(
        %program,
        code = ?status.code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        stdout_len = stdout.len(),
        "command finished"
    );

    Ok(CommandOutput {
        stdout,
        stderr,
        ok: status.success(),
        code: status.code(),
    })
}

/// Kill the child and wait for it so no zombie is left behind
async fn terminate(child: &mut Child, grace: Duration) -> Result<(), TransportError> {
    if let Err(e) = child.start_kill() {
        // Already exited between the timeout firing and the kill
        if e.kind() != io::ErrorKind::InvalidInput {
            return Err(TransportError::Kill(e));
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Kill(e)),
        Err(_) => Err(TransportError::Kill(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("child still running {grace:?} after kill"),
        ))),
    }
}

async fn read_to_string<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut bytes = Vec::new();
    if pipe.read_to_end(&mut bytes).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
