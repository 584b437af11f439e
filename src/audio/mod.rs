//! Audio subsystem module

pub mod format;
pub mod ring;
pub mod tone;

pub use format::PcmFormat;
pub use ring::{BufferRing, ReclaimPolicy, RingOptions, RingStats, SlotHandle};
pub use tone::ToneGenerator;
