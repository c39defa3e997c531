//! The log engine
//!
//! [`LogEngine`] owns both journal streams, the database ingestion queue and
//! the background tasks of the current logging session. Public operations
//! return without waiting on the host: anything that talks to the transport
//! runs on a spawned task and reports back through [`EngineEvent`]s.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use spacelog_transport::{CommandOutput, JournalQuery, Session, Transport, TransportError};
use spacelog_types::{Severity, StreamKind, canonical_timestamp};

use crate::config::{EngineConfig, SchedulingMode};
use crate::cursor::StreamCursor;
use crate::events::EngineEvent;
use crate::parser::NormalizeContext;
use crate::queue::RateLimitedQueue;
use crate::store::StateStore;
use crate::stream::{PollOutcome, StreamHandle, StreamScheduler, history, to_chrono};

const MIB: f64 = 1024.0 * 1024.0;

/// Which module is logged and what to clear when logging starts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleSettings {
    /// Module whose database log is followed; `None` disables that stream
    pub module: Option<String>,
    pub clear_module_log_at_start: bool,
    pub clear_database_log_at_start: bool,
}

/// On-host journal sizes in MiB
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JournalSizes {
    pub module_mib: Option<f64>,
    pub database_mib: Option<f64>,
}

/// Messages shown at most once per configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Notice {
    NoTransport,
    TransportUnavailable,
    NoModule,
    JournalPermission,
    Authentication,
}

#[derive(Debug)]
struct ServerState {
    running: bool,
    stopped_at: Option<DateTime<Utc>>,
    /// `start_logging` arrived while the server was down
    pending_start: bool,
    auto_stop: Option<CancellationToken>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            running: true,
            stopped_at: None,
            pending_start: false,
            auto_stop: None,
        }
    }
}

/// Normalized database line waiting for the drain task
#[derive(Debug)]
struct QueuedLine {
    /// Stream generation the line was read under
    generation: u64,
    line: String,
}

/// What a finished query changed, to be published outside the locks
#[derive(Debug, Default)]
struct Applied {
    lines: usize,
    module_updated: bool,
    /// Database lines to append directly when no drain task runs
    direct: Vec<QueuedLine>,
}

/// State shared between the engine handle and its background tasks
pub(crate) struct Shared {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    events: mpsc::UnboundedSender<EngineEvent>,
    runtime: Handle,
    session: RwLock<Option<Arc<Session>>>,
    settings: RwLock<ModuleSettings>,
    module_log: StreamHandle,
    database_log: StreamHandle,
    queue: RateLimitedQueue<QueuedLine>,
    server: Mutex<ServerState>,
    scheduler: Mutex<Option<StreamScheduler>>,
    notices: Mutex<HashSet<Notice>>,
}

impl Shared {
    fn stream(&self, kind: StreamKind) -> &StreamHandle {
        match kind {
            StreamKind::ModuleLog => &self.module_log,
            StreamKind::DatabaseLog => &self.database_log,
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    fn is_logging(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    fn status(&self, message: impl Into<String>, severity: Severity) {
        let message = message.into();
        match severity {
            Severity::Info => info!(%message, "status"),
            Severity::Warn => warn!(%message, "status"),
            Severity::Error => error!(%message, "status"),
        }
        let _ = self.events.send(EngineEvent::Status { message, severity });
    }

    fn notice_once(&self, notice: Notice, message: impl Into<String>, severity: Severity) {
        if self.notices.lock().insert(notice) {
            self.status(message, severity);
        }
    }

    /// Refresh the consumer snapshot of a stream and notify
    fn publish(&self, kind: StreamKind) {
        {
            let mut state = self.stream(kind).state.lock();
            state.cached = state.buffer.as_str().to_string();
        }
        let _ = self.events.send(EngineEvent::log_updated(kind));
    }

    /// Write the stream snapshot, at most once per persistence interval
    /// unless `force` is set
    fn persist(&self, kind: StreamKind, force: bool) {
        let snapshot = {
            let mut state = self.stream(kind).state.lock();
            let recent = state
                .last_persist
                .is_some_and(|at| at.elapsed() < self.config.persist_interval);
            if recent && !force {
                return;
            }
            state.last_persist = Some(Instant::now());
            state.snapshot()
        };
        if let Err(e) = self.store.save(kind, &snapshot) {
            warn!(stream = %kind, error = %e, "failed to persist stream state");
        }
    }

    fn append_marker(&self, kind: StreamKind, marker: &str) {
        self.stream(kind).state.lock().buffer.append_marker(marker);
        self.publish(kind);
    }

    /// Empty a stream and start suppressing records from before `now`
    fn reset_stream(&self, kind: StreamKind, now: DateTime<Utc>) {
        if kind == StreamKind::DatabaseLog {
            self.queue.clear();
        }
        {
            let mut state = self.stream(kind).state.lock();
            state.generation += 1;
            state.buffer.clear();
            state.cursor = StreamCursor::cleared(now, to_chrono(self.config.fresh_start_allowance));
        }
        self.publish(kind);
        self.persist(kind, true);
    }

    /// Append queued lines read under the current generation
    fn apply_database_batch(&self, batch: Vec<QueuedLine>) {
        let queued = batch.len();
        let appended = {
            let mut state = self.database_log.state.lock();
            let generation = state.generation;
            let lines: Vec<String> = batch
                .into_iter()
                .filter(|queued| queued.generation == generation)
                .map(|queued| queued.line)
                .collect();
            state.buffer.append_batch(&lines)
        };
        trace!(queued, appended, "database batch applied");
        if appended > 0 {
            self.publish(StreamKind::DatabaseLog);
            self.persist(StreamKind::DatabaseLog, false);
        }
    }

    /// Apply everything still queued right away
    fn flush_queue(&self) {
        self.queue.flush(|batch| self.apply_database_batch(batch));
    }

    async fn drain_queue(&self, cancel: &CancellationToken) {
        self.queue
            .drain(self.config.queue_drain_interval, cancel, |batch| {
                self.apply_database_batch(batch)
            })
            .await;
    }

    /// Poll one stream. Failures are absorbed here and reported as status
    /// events.
    ///
    /// Only one poll per stream runs at a time. A poll requested while
    /// another one runs is carried out by that one once it finishes.
    pub(crate) async fn poll(&self, kind: StreamKind, cancel: &CancellationToken) -> PollOutcome {
        let stream = self.stream(kind);
        let mut outcome = PollOutcome::Skipped;
        loop {
            let Some(guard) = stream.try_begin_poll() else {
                trace!(stream = %kind, "previous poll still running");
                return outcome;
            };
            outcome = self.poll_once(kind, cancel).await;
            drop(guard);

            if cancel.is_cancelled() || !stream.poll_requested() {
                return outcome;
            }
            debug!(stream = %kind, "poll requested while polling, querying again");
        }
    }

    /// Poll a stream with a query that starts after this call
    async fn poll_now(&self, kind: StreamKind, cancel: &CancellationToken) -> PollOutcome {
        self.stream(kind).request_poll();
        self.poll(kind, cancel).await
    }

    async fn poll_once(&self, kind: StreamKind, cancel: &CancellationToken) -> PollOutcome {
        let stream = self.stream(kind);
        let Some(session) = self.session() else {
            return PollOutcome::NotConfigured;
        };
        if kind == StreamKind::DatabaseLog && self.settings.read().module.is_none() {
            return PollOutcome::NotConfigured;
        }

        let timeout = self.config.query_timeout;
        let binary = session.journalctl(timeout, cancel).await.to_string();
        let (since, generation) = {
            let state = stream.state.lock();
            (state.cursor.position(), state.generation)
        };
        let query = JournalQuery::new(binary, self.config.unit(kind), since);
        let started = Instant::now();

        let result = session.run(&query.command_line(), timeout, cancel).await;

        let applied = match self.apply_query(kind, generation, &result, cancel) {
            Ok(applied) => applied,
            Err(outcome) => {
                match (&outcome, &result) {
                    (PollOutcome::Failed, Err(e)) => {
                        self.report_failure(kind, e);
                        self.persist(kind, false);
                    }
                    _ => debug!(stream = %kind, ?outcome, "poll result discarded"),
                }
                return outcome;
            }
        };

        if let Ok(output) = &result {
            self.inspect_output(kind, &session, output);
        }
        if applied.module_updated {
            self.publish(kind);
        }
        if !applied.direct.is_empty() {
            self.apply_database_batch(applied.direct);
        }
        self.persist(kind, false);

        debug!(
            stream = %kind,
            lines = applied.lines,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "poll complete"
        );
        PollOutcome::Completed {
            lines: applied.lines,
        }
    }

    /// Fold a finished query into its stream.
    ///
    /// Runs under the scheduler lock: a concurrent stop either cancels the
    /// result or finds its lines queued and flushes them. A reset since the
    /// query started discards the result.
    fn apply_query(
        &self,
        kind: StreamKind,
        generation: u64,
        result: &Result<CommandOutput, TransportError>,
        cancel: &CancellationToken,
    ) -> Result<Applied, PollOutcome> {
        let stream = self.stream(kind);
        let now = Utc::now();
        let server_stopped_at = self.server.lock().stopped_at;

        let slot = self.scheduler.lock();
        if cancel.is_cancelled() {
            return Err(PollOutcome::Cancelled);
        }
        let mut state = stream.state.lock();
        if state.generation != generation {
            return Err(PollOutcome::Superseded);
        }
        state.last_poll = Some(now);

        let output = match result {
            Ok(output) => output,
            Err(_) => {
                state.cursor.advance(None);
                return Err(PollOutcome::Failed);
            }
        };

        let ctx = NormalizeContext {
            cursor: &state.cursor,
            now,
            verbose: self.config.debug,
            server_stopped_at,
            stop_grace: to_chrono(self.config.server_stop_grace),
        };
        let mut newest: Option<DateTime<Utc>> = None;
        let mut lines = Vec::new();
        for raw in output.stdout.lines() {
            newest = newest.max(stream.normalizer.record_time(raw));
            if let Some(line) = stream.normalizer.normalize(raw, &ctx) {
                lines.push(line);
            }
        }
        state.cursor.advance(newest);

        let mut applied = Applied {
            lines: lines.len(),
            ..Default::default()
        };
        match kind {
            StreamKind::ModuleLog => {
                for line in &lines {
                    if state.buffer.append_unique(line) {
                        applied.module_updated = true;
                    }
                }
            }
            StreamKind::DatabaseLog => {
                let queued = lines
                    .into_iter()
                    .map(|line| QueuedLine { generation, line });
                if slot.is_some() {
                    self.queue.extend(queued);
                } else {
                    applied.direct = queued.collect();
                }
            }
        }
        Ok(applied)
    }

    fn inspect_output(&self, kind: StreamKind, session: &Session, output: &CommandOutput) {
        if is_journal_permission_denied(&output.stderr) || is_journal_permission_denied(&output.stdout) {
            self.notice_once(
                Notice::JournalPermission,
                format!(
                    "Journal access denied on {}: add the user to the systemd-journal group \
                     (sudo usermod -aG systemd-journal <user>) and reconnect",
                    session.target()
                ),
                Severity::Warn,
            );
        } else if output.stderr.contains("Permission denied (publickey") {
            self.notice_once(
                Notice::Authentication,
                format!(
                    "Authentication to {} failed. {}",
                    session.target(),
                    session.transport().verify_hint()
                ),
                Severity::Error,
            );
        } else if !output.ok {
            // A unit that does not exist yet is expected, keep polling
            debug!(stream = %kind, code = ?output.code, stderr = %output.stderr.trim(), "journal query exited with failure");
        }
    }

    fn report_failure(&self, kind: StreamKind, err: &TransportError) {
        match err {
            TransportError::Kill(_) => {
                self.status(format!("{kind} log: {err}"), Severity::Error);
            }
            TransportError::NotConfigured(_) | TransportError::Spawn { .. } => {
                self.notice_once(
                    Notice::TransportUnavailable,
                    format!("Cannot run journal queries: {err}"),
                    Severity::Error,
                );
            }
            _ => {
                debug!(stream = %kind, error = %err, "journal query failed");
                if self.config.debug {
                    self.status(format!("{kind} log poll failed: {err}"), Severity::Info);
                }
            }
        }
    }

    /// Point the database log service at `module`, if a command is configured
    async fn retarget(&self, module: &str, cancel: &CancellationToken) {
        let Some(command) = self.config.retarget_command_for(module) else {
            return;
        };
        let Some(session) = self.session() else {
            return;
        };
        match session.run(&command, self.config.query_timeout, cancel).await {
            Ok(output) if output.ok => {
                self.status(format!("Database log now follows {module}"), Severity::Info);
            }
            Ok(output) => self.status(
                format!(
                    "Retargeting the database log to {module} failed: {}",
                    output.stderr.trim()
                ),
                Severity::Warn,
            ),
            Err(TransportError::Cancelled) => {}
            Err(e) => self.status(
                format!("Retargeting the database log to {module} failed: {e}"),
                Severity::Warn,
            ),
        }
    }
}

fn is_journal_permission_denied(text: &str) -> bool {
    text.contains("insufficient permissions")
        || text.contains("not seeing messages from other users")
}

fn to_mib(size: Result<Option<u64>, TransportError>, unit: &str) -> Option<f64> {
    match size {
        Ok(bytes) => bytes.map(|b| b as f64 / MIB),
        Err(e) => {
            debug!(%unit, error = %e, "journal size query failed");
            None
        }
    }
}

/// Incremental journal poller for the module and database logs
#[derive(Clone)]
pub struct LogEngine {
    shared: Arc<Shared>,
}

impl LogEngine {
    /// Create an engine and the receiving end of its event channel.
    ///
    /// Must be called from within a Tokio runtime; background work is
    /// spawned onto it, so the other operations may be called from any
    /// thread.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let shared = Shared {
            module_log: StreamHandle::new(StreamKind::ModuleLog, &config, now),
            database_log: StreamHandle::new(StreamKind::DatabaseLog, &config, now),
            queue: RateLimitedQueue::new(config.queue_batch_size),
            config,
            store,
            events,
            runtime: Handle::current(),
            session: RwLock::new(None),
            settings: RwLock::new(ModuleSettings::default()),
            server: Mutex::new(ServerState::default()),
            scheduler: Mutex::new(None),
            notices: Mutex::new(HashSet::new()),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Set the module, the clear-at-start flags and the transport, and
    /// restore both streams from the state store. Stops logging first if it
    /// is running.
    pub fn configure(&self, settings: ModuleSettings, transport: Option<Arc<dyn Transport>>) {
        let shared = &self.shared;
        if shared.is_logging() {
            self.stop_logging();
        }

        shared.notices.lock().clear();
        let target = transport.as_ref().map(|t| t.target());
        *shared.session.write() = transport.map(|t| Arc::new(Session::new(t)));
        info!(module = ?settings.module, target = ?target, "engine configured");
        *shared.settings.write() = settings;

        let now = Utc::now();
        for kind in StreamKind::ALL {
            let snapshot = match shared.store.load(kind) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    shared.status(
                        format!("Saved {kind} log state could not be read: {e}"),
                        Severity::Warn,
                    );
                    None
                }
            };
            shared.stream(kind).restore(snapshot.as_ref(), &shared.config, now);
            let _ = shared.events.send(EngineEvent::log_updated(kind));
        }
    }

    /// Begin polling both streams. Deferred until the server runs.
    pub fn start_logging(&self) {
        let shared = &self.shared;
        {
            let mut server = shared.server.lock();
            if !server.running {
                server.pending_start = true;
                drop(server);
                shared.status(
                    "Server is not running; logging starts together with it",
                    Severity::Info,
                );
                return;
            }
            server.pending_start = false;
        }

        let mut slot = shared.scheduler.lock();
        if slot.is_some() {
            debug!("logging already running");
            return;
        }
        let Some(session) = shared.session() else {
            drop(slot);
            shared.notice_once(
                Notice::NoTransport,
                "No connection configured; log polling cannot start",
                Severity::Error,
            );
            return;
        };

        let settings = shared.settings.read().clone();
        let now = Utc::now();
        let interval = shared.config.poll_interval(session.kind());
        let mut scheduler = StreamScheduler::new(interval);

        for kind in StreamKind::ALL {
            let clear = match kind {
                StreamKind::ModuleLog => settings.clear_module_log_at_start,
                StreamKind::DatabaseLog => {
                    if settings.module.is_none() {
                        shared.notice_once(
                            Notice::NoModule,
                            "No module selected; database log polling is disabled",
                            Severity::Warn,
                        );
                        continue;
                    }
                    settings.clear_database_log_at_start
                }
            };

            if clear {
                shared.reset_stream(kind, now);
            } else {
                let mut state = shared.stream(kind).state.lock();
                state.cursor = state.cursor.resume(now, history(&shared.config));
            }

            match shared.config.scheduling {
                SchedulingMode::Timer => {
                    scheduler.spawn_poll_loop(&shared.runtime, Arc::clone(shared), kind)
                }
                SchedulingMode::Manual => scheduler.activate(kind),
            }
        }

        let drainer = Arc::clone(shared);
        let cancel = scheduler.token();
        scheduler.spawn(&shared.runtime, async move {
            drainer.drain_queue(&cancel).await;
        });
        *slot = Some(scheduler);
        drop(slot);

        shared.status(
            format!(
                "Log polling started on {} every {}ms",
                session.target(),
                interval.as_millis()
            ),
            Severity::Info,
        );
    }

    /// Stop polling. Safe at any time; an in-flight query is killed and its
    /// result discarded.
    pub fn stop_logging(&self) {
        drop(self.stop_tasks());
    }

    fn stop_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let shared = &self.shared;
        shared.server.lock().pending_start = false;
        let (database_was_active, tasks) = {
            let mut slot = shared.scheduler.lock();
            let Some(mut scheduler) = slot.take() else {
                return Vec::new();
            };
            (scheduler.is_active(StreamKind::DatabaseLog), scheduler.stop())
        };
        shared.flush_queue();

        let now = Utc::now();
        for kind in StreamKind::ALL {
            shared.stream(kind).state.lock().cursor = StreamCursor::recent(now, history(&shared.config));
        }
        if database_was_active {
            shared.append_marker(
                StreamKind::DatabaseLog,
                &format!("{} [DATABASE LOG STOPPED]", canonical_timestamp(now)),
            );
        }
        for kind in StreamKind::ALL {
            shared.persist(kind, true);
        }

        shared.status("Log polling stopped", Severity::Info);
        tasks
    }

    /// Stop logging and wait for every background task to finish
    pub async fn shutdown(&self) {
        let tasks = self.stop_tasks();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "background task failed");
            }
        }
    }

    pub fn clear_module_log(&self) {
        self.shared.reset_stream(StreamKind::ModuleLog, Utc::now());
        self.shared.status("Module log cleared", Severity::Info);
    }

    pub fn clear_database_log(&self) {
        self.shared.reset_stream(StreamKind::DatabaseLog, Utc::now());
        self.shared.status("Database log cleared", Severity::Info);
    }

    /// Follow another module's database log. The module stream is untouched.
    pub fn switch_module(&self, module: impl Into<String>, clear_database_log: bool) {
        let shared = &self.shared;
        let module = module.into();
        let previous = shared.settings.write().module.replace(module.clone());
        let now = Utc::now();

        if clear_database_log {
            shared.reset_stream(StreamKind::DatabaseLog, now);
        } else {
            shared.flush_queue();
        }
        let marker = format!(
            "{} [MODULE SWITCHED] {} -> {module}",
            canonical_timestamp(now),
            previous.as_deref().unwrap_or("none")
        );
        {
            // Anything still in flight was read for the previous module
            let mut state = shared.database_log.state.lock();
            state.generation += 1;
            state.buffer.append_marker(&marker);
        }
        shared.publish(StreamKind::DatabaseLog);
        shared.persist(StreamKind::DatabaseLog, true);
        shared.status(format!("Switched to module {module}"), Severity::Info);

        let mut slot = shared.scheduler.lock();
        let Some(scheduler) = slot.as_mut() else {
            return;
        };
        if !scheduler.is_active(StreamKind::DatabaseLog) {
            match shared.config.scheduling {
                SchedulingMode::Timer => scheduler.spawn_poll_loop(
                    &shared.runtime,
                    Arc::clone(shared),
                    StreamKind::DatabaseLog,
                ),
                SchedulingMode::Manual => scheduler.activate(StreamKind::DatabaseLog),
            }
        }

        let task_shared = Arc::clone(shared);
        let cancel = scheduler.token();
        scheduler.spawn(&shared.runtime, async move {
            task_shared.retarget(&module, &cancel).await;
            task_shared.poll_now(StreamKind::DatabaseLog, &cancel).await;
        });
    }

    /// Poll every active stream now, outside the timer
    pub fn force_refresh(&self) {
        let shared = &self.shared;
        let mut slot = shared.scheduler.lock();
        let Some(scheduler) = slot.as_mut() else {
            drop(slot);
            shared.status("Logging is not running", Severity::Info);
            return;
        };
        for kind in scheduler.active().to_vec() {
            shared.stream(kind).request_poll();
            self.spawn_poll(scheduler, kind);
        }
    }

    /// Drive polling in [`SchedulingMode::Manual`]. Starts a poll for every
    /// stream whose interval has elapsed and returns how many were started.
    pub fn tick(&self, now: Instant) -> usize {
        let shared = &self.shared;
        if shared.config.scheduling != SchedulingMode::Manual {
            return 0;
        }
        let mut slot = shared.scheduler.lock();
        let Some(scheduler) = slot.as_mut() else {
            return 0;
        };
        let due = scheduler.due(now);
        for kind in &due {
            self.spawn_poll(scheduler, *kind);
        }
        due.len()
    }

    fn spawn_poll(&self, scheduler: &mut StreamScheduler, kind: StreamKind) {
        let shared = Arc::clone(&self.shared);
        let cancel = scheduler.token();
        scheduler.spawn(&self.shared.runtime, async move {
            shared.poll(kind, &cancel).await;
        });
    }

    /// Poll one stream and wait for the result
    pub async fn poll(&self, kind: StreamKind) -> PollOutcome {
        let cancel = self
            .shared
            .scheduler
            .lock()
            .as_ref()
            .map(StreamScheduler::token)
            .unwrap_or_default();
        self.shared.poll(kind, &cancel).await
    }

    /// Tell the engine whether the SpacetimeDB server runs.
    ///
    /// A start requested while the server was down happens now. A stop keeps
    /// logging for the grace period so shutdown output is still captured.
    pub fn set_server_running(&self, running: bool) {
        let shared = &self.shared;
        let mut server = shared.server.lock();
        let was_running = std::mem::replace(&mut server.running, running);

        if running {
            server.stopped_at = None;
            if let Some(token) = server.auto_stop.take() {
                token.cancel();
            }
            let pending = std::mem::take(&mut server.pending_start);
            drop(server);
            if pending {
                self.start_logging();
            }
            return;
        }

        if !was_running {
            return;
        }
        server.stopped_at = Some(Utc::now());
        if !shared.is_logging() {
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = server.auto_stop.replace(token.clone()) {
            previous.cancel();
        }
        drop(server);

        let grace = shared.config.server_stop_grace;
        let engine = self.clone();
        shared.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let still_stopped = {
                        let mut server = engine.shared.server.lock();
                        server.auto_stop = None;
                        !server.running
                    };
                    if still_stopped {
                        engine.stop_logging();
                    }
                }
            }
        });
        shared.status(
            format!("Server stopped; logging ends in {}s", grace.as_secs()),
            Severity::Info,
        );
    }

    /// Journal sizes of both units on the host
    pub async fn journal_sizes(&self) -> JournalSizes {
        let shared = &self.shared;
        let Some(session) = shared.session() else {
            shared.notice_once(
                Notice::NoTransport,
                "No connection configured; cannot read journal sizes",
                Severity::Error,
            );
            return JournalSizes::default();
        };

        let cancel = CancellationToken::new();
        let timeout = shared.config.query_timeout;
        let module_unit = shared.config.unit(StreamKind::ModuleLog);
        let database_unit = shared.config.unit(StreamKind::DatabaseLog);
        let module = session.journal_size_bytes(module_unit, timeout, &cancel).await;
        let database = session.journal_size_bytes(database_unit, timeout, &cancel).await;

        JournalSizes {
            module_mib: to_mib(module, module_unit),
            database_mib: to_mib(database, database_unit),
        }
    }

    /// Check that the host answers. Reports the result as a status event.
    pub async fn verify_connection(&self) -> bool {
        let shared = &self.shared;
        let Some(session) = shared.session() else {
            shared.notice_once(
                Notice::NoTransport,
                "No connection configured",
                Severity::Error,
            );
            return false;
        };

        let cancel = CancellationToken::new();
        let transport = session.transport();
        match transport.verify(shared.config.query_timeout, &cancel).await {
            Ok(()) => {
                shared.status(format!("Connected to {}", session.target()), Severity::Info);
                true
            }
            Err(e) => {
                shared.status(
                    format!(
                        "Connection to {} failed: {e}. {}",
                        session.target(),
                        transport.verify_hint()
                    ),
                    Severity::Error,
                );
                false
            }
        }
    }

    /// Consumer-visible module log
    pub fn module_log(&self) -> String {
        self.shared.module_log.state.lock().cached.clone()
    }

    /// Consumer-visible database log
    pub fn database_log(&self) -> String {
        self.shared.database_log.state.lock().cached.clone()
    }

    pub fn cursor(&self, kind: StreamKind) -> DateTime<Utc> {
        self.shared.stream(kind).state.lock().cursor.position()
    }

    pub fn is_fresh_start(&self, kind: StreamKind) -> bool {
        self.shared.stream(kind).state.lock().cursor.is_fresh_start()
    }

    pub fn last_poll(&self, kind: StreamKind) -> Option<DateTime<Utc>> {
        self.shared.stream(kind).state.lock().last_poll
    }

    pub fn is_logging(&self) -> bool {
        self.shared.is_logging()
    }

    pub fn module(&self) -> Option<String> {
        self.shared.settings.read().module.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FakeTransport, output};
    use std::time::Duration;

    const MODULE_UNIT: &str = "spacetimedb.service";
    const DB_UNIT: &str = "spacetimedb-logs.service";

    fn manual_config() -> EngineConfig {
        EngineConfig {
            scheduling: SchedulingMode::Manual,
            queue_drain_interval: Duration::from_millis(10),
            persist_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn settings(module: &str) -> ModuleSettings {
        ModuleSettings {
            module: Some(module.to_string()),
            ..Default::default()
        }
    }

    fn setup(
        fake: &Arc<FakeTransport>,
        config: EngineConfig,
        store: Arc<MemoryStore>,
    ) -> (LogEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (engine, events) = LogEngine::new(config, store);
        let transport: Arc<dyn Transport> = fake.clone();
        engine.configure(settings("alpha"), Some(transport));
        (engine, events)
    }

    fn journal_line(ts: DateTime<Utc>, message: &str) -> String {
        format!(
            "{} host spacetime[42]: {message}",
            ts.format("%Y-%m-%dT%H:%M:%S%.6f+0000")
        )
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn statuses(events: &[EngineEvent], severity: Severity) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Status { message, severity: s } if *s == severity => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// True when `line` is `message` stamped with a second in `[from, to]`
    fn is_marker(line: &str, message: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        [from, to]
            .iter()
            .any(|ts| line == format!("{} {message}", canonical_timestamp(*ts)))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_module_poll_appends_canonical_line() {
        let fake = Arc::new(FakeTransport::new());
        let ts = Utc::now() - chrono::Duration::seconds(30);
        fake.set_output(MODULE_UNIT, &journal_line(ts, "INFO: Player joined"));
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        drain(&mut events);

        assert_eq!(
            engine.poll(StreamKind::ModuleLog).await,
            PollOutcome::Completed { lines: 1 }
        );
        assert_eq!(
            engine.module_log(),
            format!("{} Player joined\n", canonical_timestamp(ts))
        );
        assert!(drain(&mut events).contains(&EngineEvent::ModuleLogUpdated));
        assert!(engine.cursor(StreamKind::ModuleLog) > ts);
    }

    #[tokio::test]
    async fn test_reingesting_same_output_is_idempotent() {
        let fake = Arc::new(FakeTransport::new());
        let ts = Utc::now() - chrono::Duration::seconds(10);
        fake.set_output(MODULE_UNIT, &journal_line(ts, "INFO: Player joined"));
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        engine.poll(StreamKind::ModuleLog).await;
        let first = engine.module_log();
        drain(&mut events);

        engine.poll(StreamKind::ModuleLog).await;
        assert_eq!(engine.module_log(), first);
        assert_eq!(first.lines().count(), 1);
        assert!(!drain(&mut events).contains(&EngineEvent::ModuleLogUpdated));
    }

    #[tokio::test]
    async fn test_reingesting_database_output_is_idempotent() {
        let fake = Arc::new(FakeTransport::new());
        let ts = Utc::now() - chrono::Duration::seconds(10);
        fake.set_output(DB_UNIT, &journal_line(ts, "INFO: table created"));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();

        engine.poll(StreamKind::DatabaseLog).await;
        wait_for(|| engine.database_log().contains("table created")).await;
        engine.poll(StreamKind::DatabaseLog).await;
        wait_for(|| engine.shared.queue.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            engine.database_log(),
            format!("{} table created\n", canonical_timestamp(ts))
        );
    }

    #[tokio::test]
    async fn test_stop_during_database_poll_leaves_nothing_queued() {
        let fake = Arc::new(FakeTransport::with_delay(Duration::from_secs(5)));
        fake.set_output(DB_UNIT, &journal_line(Utc::now(), "INFO: late line"));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();
        engine.clear_database_log();

        let poller = engine.clone();
        let poll = tokio::spawn(async move { poller.poll(StreamKind::DatabaseLog).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop_logging();

        let outcome = tokio::time::timeout(Duration::from_secs(1), poll)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(engine.shared.queue.is_empty());
        let database = engine.database_log();
        assert!(!database.contains("late line"));
        assert!(database.trim_end().ends_with("[DATABASE LOG STOPPED]"));
    }

    #[tokio::test]
    async fn test_database_poll_while_stopped_appends_directly() {
        let fake = Arc::new(FakeTransport::new());
        let ts = Utc::now() - chrono::Duration::seconds(5);
        fake.set_output(DB_UNIT, &journal_line(ts, "INFO: reducer called"));
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        drain(&mut events);

        assert_eq!(
            engine.poll(StreamKind::DatabaseLog).await,
            PollOutcome::Completed { lines: 1 }
        );
        assert!(engine.shared.queue.is_empty());
        assert_eq!(
            engine.database_log(),
            format!("{} reducer called\n", canonical_timestamp(ts))
        );
        assert!(drain(&mut events).contains(&EngineEvent::DatabaseLogUpdated));
    }

    #[tokio::test]
    async fn test_overlapping_polls_are_single_flight() {
        let fake = Arc::new(FakeTransport::with_delay(Duration::from_millis(200)));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        let (a, b) = tokio::join!(
            engine.poll(StreamKind::ModuleLog),
            engine.poll(StreamKind::ModuleLog)
        );

        let outcomes = [a, b];
        assert!(outcomes.contains(&PollOutcome::Skipped));
        assert!(outcomes.contains(&PollOutcome::Completed { lines: 0 }));
        assert_eq!(fake.queries(MODULE_UNIT), 1);
        assert_eq!(fake.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_streams_poll_independently() {
        let fake = Arc::new(FakeTransport::with_delay(Duration::from_millis(100)));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        let (module, database) = tokio::join!(
            engine.poll(StreamKind::ModuleLog),
            engine.poll(StreamKind::DatabaseLog)
        );
        assert_eq!(module, PollOutcome::Completed { lines: 0 });
        assert_eq!(database, PollOutcome::Completed { lines: 0 });
        assert_eq!(fake.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_clear_hides_backlog_older_than_allowance() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();

        let cleared_at = Utc::now();
        engine.clear_database_log();
        assert!(engine.is_fresh_start(StreamKind::DatabaseLog));

        let output = [
            journal_line(cleared_at - chrono::Duration::seconds(10), "INFO: stale entry"),
            journal_line(cleared_at - chrono::Duration::seconds(2), "INFO: recent entry"),
        ]
        .join("\n");
        fake.set_output(DB_UNIT, &output);

        engine.poll(StreamKind::DatabaseLog).await;
        wait_for(|| engine.database_log().contains("recent entry")).await;
        assert!(!engine.database_log().contains("stale entry"));
    }

    #[tokio::test]
    async fn test_switch_module_polls_database_immediately() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();

        let now = Utc::now();
        fake.set_output(MODULE_UNIT, &journal_line(now, "INFO: module line"));
        fake.set_output(DB_UNIT, &journal_line(now, "INFO: alpha says hi"));
        engine.poll(StreamKind::ModuleLog).await;
        engine.poll(StreamKind::DatabaseLog).await;
        wait_for(|| engine.database_log().contains("alpha says hi")).await;

        fake.set_output(DB_UNIT, "");
        let before = fake.queries(DB_UNIT);
        let switched_from = Utc::now();
        engine.switch_module("beta", true);
        let switched_to = Utc::now();
        wait_for(|| fake.queries(DB_UNIT) > before).await;

        let database = engine.database_log();
        assert_eq!(database.lines().count(), 1);
        assert!(is_marker(
            database.trim_end(),
            "[MODULE SWITCHED] alpha -> beta",
            switched_from,
            switched_to
        ));
        assert!(engine.module_log().contains("module line"));
        assert_eq!(engine.module().as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_switch_during_poll_discards_old_module_and_requeries() {
        let fake = Arc::new(FakeTransport::with_delay(Duration::from_millis(300)));
        let now = Utc::now();
        fake.push_result(DB_UNIT, Ok(output(&journal_line(now, "INFO: alpha late line"), "")));
        fake.set_output(DB_UNIT, &journal_line(now, "INFO: beta first line"));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();

        let poller = engine.clone();
        let poll = tokio::spawn(async move { poller.poll(StreamKind::DatabaseLog).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let switched_from = Utc::now();
        engine.switch_module("beta", true);
        let switched_to = Utc::now();

        wait_for(|| engine.database_log().contains("beta first line")).await;
        poll.await.unwrap();

        let database = engine.database_log();
        let lines: Vec<&str> = database.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(is_marker(
            lines[0],
            "[MODULE SWITCHED] alpha -> beta",
            switched_from,
            switched_to
        ));
        assert!(lines[1].ends_with("beta first line"));
        assert_eq!(fake.queries(DB_UNIT), 2);
    }

    #[tokio::test]
    async fn test_retarget_runs_before_database_poll() {
        let fake = Arc::new(FakeTransport::new());
        let config = EngineConfig {
            retarget_command: Some("spacetime-logs-target {module}".to_string()),
            ..manual_config()
        };
        let (engine, _events) = setup(&fake, config, Arc::new(MemoryStore::new()));
        engine.start_logging();

        engine.switch_module("beta", false);
        wait_for(|| fake.queries(DB_UNIT) > 0).await;

        let calls = fake.calls();
        let retarget = calls
            .iter()
            .position(|c| c == "spacetime-logs-target beta")
            .unwrap();
        let query = calls
            .iter()
            .position(|c| c.contains(DB_UNIT) && c.contains("--since"))
            .unwrap();
        assert!(retarget < query);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_poll() {
        let fake = Arc::new(FakeTransport::with_delay(Duration::from_secs(5)));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();
        engine.clear_module_log();

        let poller = engine.clone();
        let poll = tokio::spawn(async move { poller.poll(StreamKind::ModuleLog).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped_from = Utc::now();
        engine.stop_logging();
        let stopped_to = Utc::now();

        let outcome = tokio::time::timeout(Duration::from_secs(1), poll)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(!engine.is_logging());
        assert!(!engine.is_fresh_start(StreamKind::ModuleLog));
        assert!(engine.cursor(StreamKind::ModuleLog) < Utc::now() - chrono::Duration::minutes(4));
        assert!(is_marker(
            engine.database_log().trim_end(),
            "[DATABASE LOG STOPPED]",
            stopped_from,
            stopped_to
        ));
    }

    #[tokio::test]
    async fn test_cursor_only_moves_forward() {
        let fake = Arc::new(FakeTransport::new());
        let old = Utc::now() - chrono::Duration::hours(1);
        fake.set_output(MODULE_UNIT, &journal_line(old, "INFO: ancient"));
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        let mut last = engine.cursor(StreamKind::ModuleLog);
        for _ in 0..3 {
            engine.poll(StreamKind::ModuleLog).await;
            let cursor = engine.cursor(StreamKind::ModuleLog);
            assert!(cursor > last);
            last = cursor;
        }

        fake.push_result(
            MODULE_UNIT,
            Err(TransportError::TimedOut(Duration::from_secs(10))),
        );
        assert_eq!(engine.poll(StreamKind::ModuleLog).await, PollOutcome::Failed);
        assert!(engine.cursor(StreamKind::ModuleLog) > last);
    }

    #[tokio::test]
    async fn test_missing_transport_is_reported_once() {
        let (engine, mut events) = LogEngine::new(manual_config(), Arc::new(MemoryStore::new()));
        engine.configure(settings("alpha"), None);

        engine.start_logging();
        engine.start_logging();

        assert!(!engine.is_logging());
        assert_eq!(statuses(&drain(&mut events), Severity::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_database_stream_needs_a_module() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, mut events) = LogEngine::new(manual_config(), Arc::new(MemoryStore::new()));
        let transport: Arc<dyn Transport> = fake.clone();
        engine.configure(ModuleSettings::default(), Some(transport));

        engine.start_logging();
        assert!(engine.is_logging());
        assert_eq!(
            engine.poll(StreamKind::DatabaseLog).await,
            PollOutcome::NotConfigured
        );
        assert_eq!(statuses(&drain(&mut events), Severity::Warn).len(), 1);
    }

    #[tokio::test]
    async fn test_permission_hint_is_shown_once() {
        let fake = Arc::new(FakeTransport::new());
        fake.set_stderr(
            MODULE_UNIT,
            "No journal files were opened due to insufficient permissions.",
        );
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        engine.poll(StreamKind::ModuleLog).await;
        engine.poll(StreamKind::ModuleLog).await;

        let hints: Vec<String> = statuses(&drain(&mut events), Severity::Warn)
            .into_iter()
            .filter(|m| m.contains("systemd-journal"))
            .collect();
        assert_eq!(hints.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_start_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTransport::new());

        let (first, _events) = setup(&fake, manual_config(), Arc::clone(&store));
        first.clear_module_log();
        drop(first);

        let (second, _events) = setup(&fake, manual_config(), Arc::clone(&store));
        second.start_logging();
        assert!(second.is_fresh_start(StreamKind::ModuleLog));
        assert!(!second.is_fresh_start(StreamKind::DatabaseLog));
    }

    #[tokio::test]
    async fn test_timer_polls_until_stopped() {
        let fake = Arc::new(FakeTransport::new());
        let config = EngineConfig {
            scheduling: SchedulingMode::Timer,
            remote_poll_interval: Duration::from_millis(20),
            ..manual_config()
        };
        let (engine, _events) = setup(&fake, config, Arc::new(MemoryStore::new()));

        engine.start_logging();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fake.queries(MODULE_UNIT) >= 3);
        assert!(fake.queries(DB_UNIT) >= 3);

        engine.stop_logging();
        let polled = fake.queries(MODULE_UNIT);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fake.queries(MODULE_UNIT), polled);
    }

    #[tokio::test]
    async fn test_manual_tick_respects_interval() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();

        let now = Instant::now();
        assert_eq!(engine.tick(now), 2);
        assert_eq!(engine.tick(now), 0);
        assert_eq!(engine.tick(now + Duration::from_secs(1)), 2);
    }

    #[tokio::test]
    async fn test_server_stop_ends_logging_after_grace() {
        let fake = Arc::new(FakeTransport::new());
        let config = EngineConfig {
            server_stop_grace: Duration::from_millis(50),
            ..manual_config()
        };
        let (engine, _events) = setup(&fake, config, Arc::new(MemoryStore::new()));
        engine.start_logging();

        engine.set_server_running(false);
        assert!(engine.is_logging());
        wait_for(|| !engine.is_logging()).await;
    }

    #[tokio::test]
    async fn test_server_restart_cancels_auto_stop() {
        let fake = Arc::new(FakeTransport::new());
        let config = EngineConfig {
            server_stop_grace: Duration::from_millis(50),
            ..manual_config()
        };
        let (engine, _events) = setup(&fake, config, Arc::new(MemoryStore::new()));
        engine.start_logging();

        engine.set_server_running(false);
        engine.set_server_running(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.is_logging());
    }

    #[tokio::test]
    async fn test_start_waits_for_server() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        engine.set_server_running(false);
        engine.start_logging();
        assert!(!engine.is_logging());

        engine.set_server_running(true);
        assert!(engine.is_logging());
    }

    #[tokio::test]
    async fn test_database_lines_arrive_in_batches() {
        let fake = Arc::new(FakeTransport::new());
        let now = Utc::now();
        let output: Vec<String> = (0..120)
            .map(|n| journal_line(now, &format!("INFO: line {n}")))
            .collect();
        fake.set_output(DB_UNIT, &output.join("\n"));
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        engine.start_logging();
        drain(&mut events);

        engine.poll(StreamKind::DatabaseLog).await;
        wait_for(|| engine.database_log().lines().count() == 120).await;

        let updates = drain(&mut events)
            .into_iter()
            .filter(|e| *e == EngineEvent::DatabaseLogUpdated)
            .count();
        assert!((1..=3).contains(&updates));
        assert!(engine.database_log().ends_with("line 119\n"));
    }

    #[tokio::test]
    async fn test_clear_persists_fresh_start() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::clone(&store));

        engine.clear_module_log();

        let saved = store.load(StreamKind::ModuleLog).unwrap().unwrap();
        assert!(saved.fresh_start);
        assert!(saved.buffer.is_empty());
        assert!(saved.fresh_start_epoch.is_some());
    }

    #[tokio::test]
    async fn test_journal_sizes_in_mib() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, _events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));

        let sizes = engine.journal_sizes().await;
        assert_eq!(sizes.module_mib, Some(2.0));
        assert_eq!(sizes.database_mib, Some(2.0));
    }

    #[tokio::test]
    async fn test_verify_connection() {
        let fake = Arc::new(FakeTransport::new());
        let (engine, mut events) = setup(&fake, manual_config(), Arc::new(MemoryStore::new()));
        drain(&mut events);

        assert!(engine.verify_connection().await);
        assert!(
            statuses(&drain(&mut events), Severity::Info)
                .iter()
                .any(|m| m.contains("fake host"))
        );
    }
}
