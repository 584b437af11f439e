//! Error types for the playback buffer ring

use std::fmt;

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device call that rejected a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStage {
    Prepare,
    Play,
}

impl fmt::Display for SubmitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitStage::Prepare => f.write_str("prepare"),
            SubmitStage::Play => f.write_str("play"),
        }
    }
}

/// Playback and buffer ring errors
///
/// Raw device status codes never escape the ring unmapped: they are carried
/// as the `code` of a `Submission` or `Reclaim` error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Failed to open output device: {0}")]
    DeviceOpen(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid ring configuration: {0}")]
    InvalidConfig(String),

    #[error("Device rejected {stage} (status {code})")]
    Submission { stage: SubmitStage, code: u32 },

    #[error("Device reported status {code} while reclaiming a buffer")]
    Reclaim { code: u32 },

    #[error("Buffer ring is closed")]
    RingClosed,

    #[error("All buffer slots are in flight")]
    Exhausted,

    #[error("Cannot submit an empty buffer")]
    EmptyBuffer,

    #[error("Slot handle is stale or unknown")]
    StaleHandle,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
