//! # waveout-ring
//!
//! Flow control for streamed PCM playback through a fixed pool of
//! device-owned buffers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  submit(bytes)   ┌──────────────────────────────┐
//! │   Producer   │ ───────────────► │          BufferRing          │
//! │ (tone, file, │  blocks while    │  ┌────────────────────────┐  │
//! │  decoder...) │  all slots busy  │  │ idle FIFO (bounded ch) │  │
//! └──────────────┘                  │  └───────────┬────────────┘  │
//!                                   │   slot 0 ─► slot 1 ─► slot 2 │
//! ┌──────────────┐ poll_completion  │      ▲                 │     │
//! │    Poller    │ ───────────────► │      └──── reclaim ◄───┘     │
//! └──────────────┘                  └──────────────┬───────────────┘
//!                                  prepare / play  │  unprepare
//!                                                  ▼
//!                                   ┌──────────────────────────────┐
//!                                   │     OutputDevice backend     │
//!                                   │  winmm │ cpal │ simulated    │
//!                                   └──────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod device;
pub mod error;

pub use audio::{BufferRing, PcmFormat, ReclaimPolicy, RingOptions, RingStats, SlotHandle};
pub use device::{DeviceStatus, OutputDevice, SlotDescriptor};
pub use error::{AudioError, Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default PCM sample width
    pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

    /// Smallest pool that hides device latency without stalling the producer
    pub const DEFAULT_SLOT_COUNT: usize = 3;

    /// Default length of each submitted buffer in milliseconds
    pub const DEFAULT_BUFFER_MS: u32 = 50;

    /// Default completion polling interval in milliseconds
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;
}
