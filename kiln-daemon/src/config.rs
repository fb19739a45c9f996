// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DaemonError, IoContext};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to bind the daemon socket
    pub socket_path: PathBuf,

    /// Seconds the server stays alive with no in-flight connections before
    /// shutting itself down. `None` disables the idle timeout.
    pub keep_alive_secs: Option<u64>,

    /// Delay before the idle memory-reclaim pass runs
    pub idle_gc_secs: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/kiln-daemon.sock"),
            keep_alive_secs: Some(600),
            idle_gc_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_secs.map(Duration::from_secs)
    }

    pub fn idle_gc_delay(&self) -> Duration {
        Duration::from_secs(self.idle_gc_secs)
    }
}
