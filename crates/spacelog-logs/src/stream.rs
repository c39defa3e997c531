use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use spacelog_types::{StreamKind, StreamSnapshot};

use crate::buffer::LogBuffer;
use crate::config::EngineConfig;
use crate::cursor::StreamCursor;
use crate::engine::Shared;
use crate::parser::LineNormalizer;

/// Result of one poll attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll of the same stream was still in flight
    Skipped,
    /// No transport, or no module for the database stream
    NotConfigured,
    /// Logging stopped while the query ran; nothing was applied
    Cancelled,
    /// The stream was cleared or switched while the query ran; nothing was
    /// applied
    Superseded,
    /// The query failed; the cursor still moved forward
    Failed,
    /// The query ran and `lines` normalized lines were handed on
    Completed { lines: usize },
}

/// Mutable state of one stream
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) cursor: StreamCursor,
    pub(crate) buffer: LogBuffer,
    /// What consumers see; refreshed right before each notification
    pub(crate) cached: String,
    pub(crate) last_poll: Option<DateTime<Utc>>,
    pub(crate) last_persist: Option<Instant>,
    /// Bumped on every reset; results of older queries are dropped
    pub(crate) generation: u64,
}

impl StreamState {
    pub(crate) fn snapshot(&self) -> StreamSnapshot {
        let mut snapshot = StreamSnapshot {
            buffer: self.buffer.as_str().to_string(),
            cached_buffer: self.cached.clone(),
            ..Default::default()
        };
        self.cursor.write_to(&mut snapshot);
        snapshot
    }
}

/// One journal stream: its state, its normalizer and the single-flight flag
#[derive(Debug)]
pub(crate) struct StreamHandle {
    kind: StreamKind,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) normalizer: LineNormalizer,
    in_flight: AtomicBool,
    /// A poll was asked for that no running poll has served yet
    requested: AtomicBool,
}

impl StreamHandle {
    pub(crate) fn new(kind: StreamKind, config: &EngineConfig, now: DateTime<Utc>) -> Self {
        let limits = config.buffer_limits(kind);
        Self {
            kind,
            state: Mutex::new(StreamState {
                cursor: StreamCursor::recent(now, history(config)),
                buffer: LogBuffer::new(limits.cap, limits.target),
                cached: String::new(),
                last_poll: None,
                last_persist: None,
                generation: 0,
            }),
            normalizer: LineNormalizer::new(kind),
            in_flight: AtomicBool::new(false),
            requested: AtomicBool::new(false),
        }
    }

    /// Replace in-memory state with a persisted snapshot
    pub(crate) fn restore(&self, snapshot: Option<&StreamSnapshot>, config: &EngineConfig, now: DateTime<Utc>) {
        let limits = config.buffer_limits(self.kind);
        let mut state = self.state.lock();
        state.generation += 1;
        state.cursor = StreamCursor::on_start(snapshot, now, history(config));
        match snapshot {
            Some(snapshot) => {
                state.buffer = LogBuffer::restore(&snapshot.buffer, limits.cap, limits.target);
                state.cached = if snapshot.cached_buffer.is_empty() {
                    state.buffer.as_str().to_string()
                } else {
                    snapshot.cached_buffer.clone()
                };
            }
            None => {
                state.buffer = LogBuffer::new(limits.cap, limits.target);
                state.cached.clear();
            }
        }
    }

    /// Claim the single-flight slot. `None` when a poll is already running.
    ///
    /// A poll that starts here serves every request made before it.
    pub(crate) fn try_begin_poll(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.requested.store(false, Ordering::SeqCst);
        Some(InFlightGuard(&self.in_flight))
    }

    /// Ask for a poll that starts after this call
    pub(crate) fn request_poll(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn poll_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Clears the in-flight flag on every exit path of a poll
pub(crate) struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn history(config: &EngineConfig) -> chrono::Duration {
    to_chrono(config.history_window)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Background tasks of one logging session
pub(crate) struct StreamScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    active: Vec<StreamKind>,
    interval: Duration,
    /// Next due time per stream in manual scheduling
    next_due: HashMap<StreamKind, Instant>,
}

impl StreamScheduler {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            active: Vec::new(),
            interval,
            next_due: HashMap::new(),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn is_active(&self, kind: StreamKind) -> bool {
        self.active.contains(&kind)
    }

    pub(crate) fn active(&self) -> &[StreamKind] {
        &self.active
    }

    /// Mark a stream as active without a timer of its own
    pub(crate) fn activate(&mut self, kind: StreamKind) {
        if !self.active.contains(&kind) {
            self.active.push(kind);
        }
    }

    /// Start the self-rescheduling poll loop of a stream
    pub(crate) fn spawn_poll_loop(&mut self, runtime: &Handle, shared: Arc<Shared>, kind: StreamKind) {
        self.activate(kind);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.tasks
            .push(runtime.spawn(run_poll_loop(shared, kind, interval, cancel)));
    }

    pub(crate) fn spawn(&mut self, runtime: &Handle, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(runtime.spawn(task));
    }

    /// Streams whose manual tick is due at `now`; schedules their next tick
    pub(crate) fn due(&mut self, now: Instant) -> Vec<StreamKind> {
        let mut due = Vec::new();
        for kind in &self.active {
            let next = self.next_due.entry(*kind).or_insert(now);
            if now >= *next {
                *next = now + self.interval;
                due.push(*kind);
            }
        }
        due
    }

    /// Cancel every task. In-flight children are killed by their own
    /// cancellation path, so handles are left to finish rather than aborted.
    pub(crate) fn stop(&mut self) -> Vec<JoinHandle<()>> {
        self.cancel.cancel();
        self.active.clear();
        self.tasks.drain(..).collect()
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_poll_loop(shared: Arc<Shared>, kind: StreamKind, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // Next tick waits a full interval after a slow poll instead of bursting
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let outcome = shared.poll(kind, &cancel).await;
                trace!(stream = %kind, ?outcome, "poll finished");
            }
        }
    }

    debug!(stream = %kind, "poll loop stopped");
}
