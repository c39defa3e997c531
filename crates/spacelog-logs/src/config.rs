use std::time::Duration;

use spacelog_types::{StreamKind, TransportKind};

/// How polls are driven
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// The engine runs its own interval timers
    #[default]
    Timer,
    /// The host calls `LogEngine::tick`
    Manual,
}

/// Size bounds for one stream buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLimits {
    /// Maximum buffer length before truncation
    pub cap: usize,
    /// Length kept after truncation
    pub target: usize,
}

/// Tunables of the log engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Poll interval over SSH
    pub remote_poll_interval: Duration,

    /// Poll interval through WSL, longer to limit process spawns
    pub virtualized_poll_interval: Duration,

    /// Wall-clock limit of one journal query
    pub query_timeout: Duration,

    /// How far back a non-fresh start looks
    pub history_window: Duration,

    /// Records this much older than a clear are still shown
    pub fresh_start_allowance: Duration,

    /// Transient database errors are always dropped this long after a stop;
    /// logging stops automatically once it has passed
    pub server_stop_grace: Duration,

    pub module_buffer: BufferLimits,
    pub database_buffer: BufferLimits,

    /// Lines drained from the database queue per batch
    pub queue_batch_size: usize,
    pub queue_drain_interval: Duration,

    /// Minimum spacing of routine snapshot writes per stream
    pub persist_interval: Duration,

    /// Keep transient database errors and log every poll
    pub debug: bool,

    /// systemd unit of the SpacetimeDB server
    pub module_unit: String,

    /// systemd unit relaying per-module logs
    pub database_unit: String,

    /// Shell command pointing the logs unit at a module; `{module}` is
    /// replaced by the module name
    pub retarget_command: Option<String>,

    pub scheduling: SchedulingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_poll_interval: Duration::from_secs(1),
            virtualized_poll_interval: Duration::from_secs(2),
            query_timeout: Duration::from_secs(10),
            history_window: Duration::from_secs(5 * 60),
            fresh_start_allowance: Duration::from_secs(5),
            server_stop_grace: Duration::from_secs(10),
            module_buffer: BufferLimits {
                cap: 75_000,
                target: 50_000,
            },
            database_buffer: BufferLimits {
                cap: 150_000,
                target: 100_000,
            },
            queue_batch_size: 50,
            queue_drain_interval: Duration::from_millis(100),
            persist_interval: Duration::from_secs(1),
            debug: false,
            module_unit: "spacetimedb.service".to_string(),
            database_unit: "spacetimedb-logs.service".to_string(),
            retarget_command: None,
            scheduling: SchedulingMode::Timer,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self, transport: TransportKind) -> Duration {
        match transport {
            TransportKind::Remote => self.remote_poll_interval,
            TransportKind::Virtualized => self.virtualized_poll_interval,
        }
    }

    pub fn buffer_limits(&self, stream: StreamKind) -> BufferLimits {
        match stream {
            StreamKind::ModuleLog => self.module_buffer,
            StreamKind::DatabaseLog => self.database_buffer,
        }
    }

    pub fn unit(&self, stream: StreamKind) -> &str {
        match stream {
            StreamKind::ModuleLog => &self.module_unit,
            StreamKind::DatabaseLog => &self.database_unit,
        }
    }

    /// Retarget command for `module`, if one is configured
    pub fn retarget_command_for(&self, module: &str) -> Option<String> {
        self.retarget_command
            .as_ref()
            .map(|template| template.replace("{module}", module))
    }
}
