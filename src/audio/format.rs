//! PCM format parameters and sample conversion
//!
//! Samples are interleaved little-endian integers. 8-bit PCM is unsigned
//! with a midpoint of 128, wider formats are signed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_BITS_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::AudioError;

/// Linear PCM stream format, fixed for the lifetime of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn new(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample,
        }
    }

    /// Check the parameters a PCM output device can accept
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.channels == 0 {
            return Err(AudioError::UnsupportedFormat("channel count must be at least 1".into()));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("sample rate must be at least 1 Hz".into()));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} bits per sample",
                self.bits_per_sample
            )));
        }
        if u16::try_from(self.channels as u32 * self.bytes_per_sample() as u32).is_err() {
            return Err(AudioError::UnsupportedFormat(format!(
                "block alignment overflows for {} channels",
                self.channels
            )));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes per frame (one sample for every channel)
    pub fn block_align(&self) -> u16 {
        self.channels.saturating_mul(self.bits_per_sample / 8)
    }

    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.sample_rate.saturating_mul(self.block_align() as u32)
    }

    /// Playback time of `bytes` of audio in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let rate = self.avg_bytes_per_sec() as u64;
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u64).saturating_mul(1_000_000_000) / rate)
    }

    /// Byte length of `duration` of audio, rounded down to whole frames
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let align = self.block_align() as u128;
        if align == 0 {
            return 0;
        }
        let frames = duration.as_nanos() * self.sample_rate as u128 / 1_000_000_000;
        (frames * align) as usize
    }

    /// Decode one sample from the front of `bytes` into `[-1.0, 1.0)`
    ///
    /// Returns silence when fewer than `bytes_per_sample` bytes remain.
    pub fn decode_sample(&self, bytes: &[u8]) -> f32 {
        match (self.bits_per_sample, bytes) {
            (8, [b, ..]) => (*b as f32 - 128.0) / 128.0,
            (16, [a, b, ..]) => i16::from_le_bytes([*a, *b]) as f32 / 32_768.0,
            (24, [a, b, c, ..]) => {
                let v = i32::from_le_bytes([0, *a, *b, *c]) >> 8;
                v as f32 / 8_388_608.0
            }
            (32, [a, b, c, d, ..]) => i32::from_le_bytes([*a, *b, *c, *d]) as f32 / 2_147_483_648.0,
            _ => 0.0,
        }
    }

    /// Append one sample, clamped to `[-1.0, 1.0]`, to `out`
    pub fn encode_sample(&self, value: f32, out: &mut Vec<u8>) {
        let v = value.clamp(-1.0, 1.0) as f64;
        match self.bits_per_sample {
            8 => out.push((v * 127.0 + 128.0).round() as u8),
            16 => out.extend_from_slice(&((v * 32_767.0).round() as i16).to_le_bytes()),
            24 => {
                let s = (v * 8_388_607.0).round() as i32;
                out.extend_from_slice(&s.to_le_bytes()[..3]);
            }
            32 => out.extend_from_slice(&((v * 2_147_483_647.0).round() as i32).to_le_bytes()),
            _ => {}
        }
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, DEFAULT_BITS_PER_SAMPLE)
    }
}
