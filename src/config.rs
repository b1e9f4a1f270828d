//! Configuration for feedview

use crate::error::{Result, ViewError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedview")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the flag database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Feed id of the local identity
    #[serde(default)]
    pub local_id: Option<String>,

    /// Materializer tuning
    #[serde(default)]
    pub views: ViewConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            local_id: None,
            views: ViewConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ViewError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ViewError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the sled database holding read and subscription flags
    pub fn flags_db_path(&self) -> PathBuf {
        self.data_dir.join("flags.sled")
    }
}

/// Materializer tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Posts by followed identities newer than this emit a `post` event
    #[serde(default = "default_recent_post_window")]
    pub recent_post_window_secs: u64,

    /// Broadcast capacity of the event hub
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Message bodies fetched concurrently while resolving index rows
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,

    /// Upper bound on reply links followed when looking for a thread root
    #[serde(default = "default_max_thread_depth")]
    pub max_thread_depth: usize,

    /// Upper bound on primary links followed during name resolution
    #[serde(default = "default_max_alias_depth")]
    pub max_alias_depth: usize,
}

fn default_recent_post_window() -> u64 {
    3600
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_resolve_concurrency() -> usize {
    16
}

fn default_max_thread_depth() -> usize {
    64
}

fn default_max_alias_depth() -> usize {
    16
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            recent_post_window_secs: default_recent_post_window(),
            event_channel_capacity: default_event_channel_capacity(),
            resolve_concurrency: default_resolve_concurrency(),
            max_thread_depth: default_max_thread_depth(),
            max_alias_depth: default_max_alias_depth(),
        }
    }
}

impl ViewConfig {
    pub fn recent_post_window(&self) -> Duration {
        Duration::from_secs(self.recent_post_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            local_id = "@abc.ed25519"

            [views]
            resolve_concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.local_id.as_deref(), Some("@abc.ed25519"));
        assert_eq!(config.views.resolve_concurrency, 4);
        assert_eq!(config.views.recent_post_window_secs, 3600);
        assert_eq!(config.views.max_thread_depth, 64);
        assert!(config.flags_db_path().ends_with("flags.sled"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feedview.toml");

        let mut config = Config::default();
        config.local_id = Some("@me.ed25519".to_string());
        config.views.event_channel_capacity = 32;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.local_id, config.local_id);
        assert_eq!(loaded.views.event_channel_capacity, 32);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feedview.toml");

        assert!(matches!(Config::load(&path), Err(ViewError::Io(_))));

        std::fs::write(&path, "[views]\nresolve_concurrency = \"many\"\n").unwrap();
        match Config::load(&path) {
            Err(ViewError::Config(message)) => assert!(message.contains("invalid type")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
