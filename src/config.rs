//! Application configuration
//!
//! Stored as TOML in the platform config directory, e.g.
//! `~/.config/waveout-ring/config.toml` on Linux.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{PcmFormat, ReclaimPolicy, RingOptions};
use crate::constants::{DEFAULT_BUFFER_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SLOT_COUNT};
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";

/// Output device implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Windows multimedia waveOut API
    WaveOut,
    /// Host default output through cpal
    Cpal,
    /// Software device that plays in real time without sound
    Simulated,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(windows) {
            BackendKind::WaveOut
        } else if cfg!(feature = "audio-cpal") {
            BackendKind::Cpal
        } else {
            BackendKind::Simulated
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub backend: BackendKind,
    pub slot_count: usize,
    pub format: PcmFormat,
    /// Length of each submitted buffer
    pub buffer_ms: u32,
    pub poll_interval_ms: u64,
    pub reclaim_policy: ReclaimPolicy,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            slot_count: DEFAULT_SLOT_COUNT,
            format: PcmFormat::default(),
            buffer_ms: DEFAULT_BUFFER_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reclaim_policy: ReclaimPolicy::default(),
        }
    }
}

impl PlaybackConfig {
    pub fn ring_options(&self) -> RingOptions {
        RingOptions {
            slot_count: self.slot_count,
            reclaim_policy: self.reclaim_policy,
        }
    }

    /// Bytes per submitted buffer, at least one frame
    pub fn buffer_bytes(&self) -> usize {
        let bytes = self
            .format
            .bytes_for(Duration::from_millis(self.buffer_ms as u64));
        bytes.max(self.format.block_align() as usize)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Default config file location, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "waveout-ring")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from `path`, or the default location, falling back to defaults
    /// when no file exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::info!("Loading config from {}", path.display());
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.playback.slot_count == 0 {
            return Err(Error::Config("playback.slot_count must be at least 1".into()));
        }
        if self.playback.buffer_ms == 0 {
            return Err(Error::Config("playback.buffer_ms must be at least 1".into()));
        }
        self.playback.format.validate()?;
        Ok(())
    }
}
