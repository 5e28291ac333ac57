//! chronod configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChronodConfig {
    /// Address the control socket binds to. Local only by default.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Global cap on simultaneously running jobs.
    #[serde(default = "default_max_procs")]
    pub max_procs: usize,
    /// Directory holding persisted state and signal files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// How often dirty state is flushed and signal files are checked.
    #[serde(default = "default_flush_secs")]
    pub flush_secs: u64,
    /// Idle client connections are dropped after this many seconds.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    /// Default tracing filter, overridable with RUST_LOG.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_listen_host() -> String {
    "127.0.0.1".into()
}
fn default_listen_port() -> u16 {
    10829
}
fn default_max_procs() -> usize {
    30
}
fn default_state_dir() -> PathBuf {
    ChronodConfig::home_dir().join("state")
}
fn default_flush_secs() -> u64 {
    3
}
fn default_client_timeout_secs() -> u64 {
    300
}
fn default_log_filter() -> String {
    "info".into()
}

impl Default for ChronodConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            max_procs: default_max_procs(),
            state_dir: default_state_dir(),
            flush_secs: default_flush_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl ChronodConfig {
    /// Load config from the default path (~/.chronod/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::ChronodError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::ChronodError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ChronodError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the chronod home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chronod")
    }

    /// Path of the schedule-definitions document.
    pub fn schedules_path(&self) -> PathBuf {
        self.state_dir.join("schedules.json")
    }

    /// Path of the trigger/statistics cache document.
    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("cache.json")
    }

    /// Requesting a clean shutdown: touch this file.
    pub fn stop_signal_path(&self) -> PathBuf {
        self.state_dir.join(".stop_notify")
    }

    /// Requesting a restart by an external supervisor: touch this file.
    pub fn reload_signal_path(&self) -> PathBuf {
        self.state_dir.join(".reload_notify")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local_only() {
        let cfg = ChronodConfig::default();
        assert_eq!(cfg.listen_host, "127.0.0.1");
        assert_eq!(cfg.listen_port, 10829);
        assert_eq!(cfg.max_procs, 30);
        assert_eq!(cfg.flush_secs, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ChronodConfig = toml::from_str("listen_port = 4444").unwrap();
        assert_eq!(cfg.listen_port, 4444);
        assert_eq!(cfg.listen_host, "127.0.0.1");
        assert_eq!(cfg.client_timeout_secs, 300);
    }

    #[test]
    fn state_paths_hang_off_state_dir() {
        let mut cfg = ChronodConfig::default();
        cfg.state_dir = PathBuf::from("/tmp/chronod-test");
        assert_eq!(cfg.schedules_path(), PathBuf::from("/tmp/chronod-test/schedules.json"));
        assert_eq!(cfg.cache_path(), PathBuf::from("/tmp/chronod-test/cache.json"));
    }
}
