//! Scripted transport for engine tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use spacelog_transport::{CommandOutput, Transport, TransportError, TransportKind};

/// Answers journal queries from canned output, keyed by unit
pub(crate) struct FakeTransport {
    delay: Duration,
    sticky: Mutex<HashMap<String, CommandOutput>>,
    queued: Mutex<HashMap<String, VecDeque<Result<CommandOutput, TransportError>>>>,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Every query takes `delay` unless cancelled first
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            sticky: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Output returned for `unit` whenever nothing is queued
    pub(crate) fn set_output(&self, unit: &str, stdout: &str) {
        self.sticky.lock().insert(unit.to_string(), output(stdout, ""));
    }

    pub(crate) fn set_stderr(&self, unit: &str, stderr: &str) {
        self.sticky.lock().insert(unit.to_string(), output("", stderr));
    }

    /// One-shot result for the next query of `unit`
    pub(crate) fn push_result(&self, unit: &str, result: Result<CommandOutput, TransportError>) {
        self.queued
            .lock()
            .entry(unit.to_string())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of journal queries issued for `unit`
    pub(crate) fn queries(&self, unit: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| unit_of(call) == Some(unit) && call.contains("--since"))
            .count()
    }

    /// Highest number of queries that were running at once
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub(crate) fn output(stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        ok: true,
        code: Some(0),
    }
}

fn unit_of(command_line: &str) -> Option<&str> {
    command_line
        .split_whitespace()
        .skip_while(|token| *token != "-u")
        .nth(1)
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn target(&self) -> String {
        "fake host".to_string()
    }

    fn command(&self, _command_line: &str) -> Result<tokio::process::Command, TransportError> {
        Err(TransportError::NotConfigured("scripted transport".to_string()))
    }

    fn verify_hint(&self) -> &'static str {
        "check the scripted transport"
    }

    async fn run(
        &self,
        command_line: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransportError> {
        self.calls.lock().push(command_line.to_string());

        if command_line.starts_with("command -v journalctl") {
            return Ok(output("/usr/bin/journalctl\n", ""));
        }
        if command_line.starts_with("echo ") {
            return Ok(output("spacelog-ok\n", ""));
        }

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let waited = if self.delay.is_zero() {
            Ok(())
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        waited?;

        let Some(unit) = unit_of(command_line) else {
            return Ok(output("", ""));
        };
        if let Some(result) = self.queued.lock().get_mut(unit).and_then(VecDeque::pop_front) {
            return result;
        }
        if command_line.contains("wc -c") {
            return Ok(output("2097152\n", ""));
        }
        Ok(self
            .sticky
            .lock()
            .get(unit)
            .cloned()
            .unwrap_or_else(|| output("", "")))
    }
}
