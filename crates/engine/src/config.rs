use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictPolicy;

/// Configuration for the job queue engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary used for transcoding
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary used for media inspection
    pub ffprobe_bin: PathBuf,
    /// Default directory for outputs when a job does not name one
    pub download_dir: PathBuf,
    /// Destination conflict policy applied when a job does not override it
    pub conflict_policy: ConflictPolicy,
    /// When false, the worker auto-pauses once the queue drains
    pub auto_continue: bool,
    /// Worker idle/pause tick in milliseconds
    pub tick_ms: u64,
    /// How long to wait for a killed child process before giving up, seconds
    pub kill_timeout_secs: u64,
    /// Capacity of the bounded notification channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            download_dir: PathBuf::from("."),
            conflict_policy: ConflictPolicy::Rename,
            auto_continue: false,
            tick_ms: 200,
            kill_timeout_secs: 10,
            event_capacity: 256,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: EngineConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: EngineConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}
