//! Config file loading
//!
//! Every field is optional; anything left out keeps the engine default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use spacelog_logs::EngineConfig;

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Module whose database log is followed
    pub module: Option<String>,
    pub clear_module_log_at_start: Option<bool>,
    pub clear_database_log_at_start: Option<bool>,

    /// Directory holding persisted stream state
    pub state_dir: Option<PathBuf>,

    pub remote_poll_interval_ms: Option<u64>,
    pub virtualized_poll_interval_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
    pub history_window_ms: Option<u64>,
    pub fresh_start_allowance_ms: Option<u64>,
    pub server_stop_grace_ms: Option<u64>,
    pub queue_drain_interval_ms: Option<u64>,
    pub persist_interval_ms: Option<u64>,
    pub queue_batch_size: Option<usize>,

    pub module_buffer_cap: Option<usize>,
    pub module_buffer_target: Option<usize>,
    pub database_buffer_cap: Option<usize>,
    pub database_buffer_target: Option<usize>,

    pub module_unit: Option<String>,
    pub database_unit: Option<String>,
    /// Run on module switch; `{module}` is replaced by the module name
    pub retarget_command: Option<String>,

    pub ssh_connect_timeout_secs: Option<u32>,
}

impl AppConfig {
    /// `<config dir>/spacelog/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("spacelog").join("config.toml"))
    }

    /// Load `path`, or the default file if it exists.
    ///
    /// An explicitly given file must exist; a missing default file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Engine settings with file values applied over the defaults
    pub fn engine_config(&self, debug: bool) -> EngineConfig {
        let mut config = EngineConfig::default();
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);

        config.remote_poll_interval = ms(self.remote_poll_interval_ms, config.remote_poll_interval);
        config.virtualized_poll_interval =
            ms(self.virtualized_poll_interval_ms, config.virtualized_poll_interval);
        config.query_timeout = ms(self.query_timeout_ms, config.query_timeout);
        config.history_window = ms(self.history_window_ms, config.history_window);
        config.fresh_start_allowance = ms(self.fresh_start_allowance_ms, config.fresh_start_allowance);
        config.server_stop_grace = ms(self.server_stop_grace_ms, config.server_stop_grace);
        config.queue_drain_interval = ms(self.queue_drain_interval_ms, config.queue_drain_interval);
        config.persist_interval = ms(self.persist_interval_ms, config.persist_interval);

        if let Some(size) = self.queue_batch_size {
            config.queue_batch_size = size;
        }
        if let Some(cap) = self.module_buffer_cap {
            config.module_buffer.cap = cap;
        }
        if let Some(target) = self.module_buffer_target {
            config.module_buffer.target = target;
        }
        if let Some(cap) = self.database_buffer_cap {
            config.database_buffer.cap = cap;
        }
        if let Some(target) = self.database_buffer_target {
            config.database_buffer.target = target;
        }
        if let Some(unit) = &self.module_unit {
            config.module_unit = unit.clone();
        }
        if let Some(unit) = &self.database_unit {
            config.database_unit = unit.clone();
        }
        config.retarget_command = self.retarget_command.clone();
        config.debug = debug;
        config
    }
}
