//! Output device abstraction
//!
//! A device plays buffers asynchronously in the order they were handed to
//! `play`. The ring never receives callbacks from a device; it polls each
//! in-flight slot with `unprepare` until the device stops reporting
//! `StillPlaying`.

use bytes::Bytes;

pub mod simulated;

#[cfg(feature = "audio-cpal")]
pub mod stream;

#[cfg(windows)]
pub mod winmm;

pub use simulated::SimulatedDevice;

#[cfg(feature = "audio-cpal")]
pub use stream::CpalDevice;

#[cfg(windows)]
pub use winmm::WaveOutDevice;

/// Raw outcome of a device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    /// The buffer is still owned by the device
    StillPlaying,
    /// Driver-specific failure code
    Failed(u32),
}

impl DeviceStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DeviceStatus::Ok)
    }
}

/// Device-visible view of one buffer slot
///
/// `next` is the index of the following slot in the cyclic chain, for
/// drivers that require linked buffer headers.
#[derive(Debug, Clone, Copy)]
pub struct SlotDescriptor<'a> {
    pub index: usize,
    pub next: usize,
    pub data: &'a Bytes,
}

impl<'a> SlotDescriptor<'a> {
    pub fn new(index: usize, next: usize, data: &'a Bytes) -> Self {
        Self { index, next, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An open output stream with a fixed number of buffer slots
///
/// Implementations may assume that the caller owns each slot index
/// exclusively: calls for the same index never overlap, and the bytes
/// passed to `prepare` stay alive and unmodified until `unprepare` returns
/// anything other than `StillPlaying`.
pub trait OutputDevice: Send + Sync {
    /// Number of slot indices this device can track
    fn slot_capacity(&self) -> usize;

    /// Register a slot's buffer with the device
    fn prepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus;

    /// Queue a prepared slot for playback
    fn play(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus;

    /// Release a slot; `StillPlaying` while the device still owns it
    fn unprepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus;

    /// Release the device. Must tolerate being called more than once.
    fn close(&self) -> DeviceStatus;
}
