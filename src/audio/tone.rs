//! Sine tone source producing interleaved PCM chunks

use bytes::Bytes;
use std::f64::consts::TAU;

use crate::audio::format::PcmFormat;

/// Generates a continuous sine wave in a given PCM format
pub struct ToneGenerator {
    format: PcmFormat,
    frequency: f64,
    amplitude: f32,
    /// Phase in cycles, kept in `[0, 1)` so long runs don't lose precision
    phase: f64,
}

impl ToneGenerator {
    pub fn new(format: PcmFormat, frequency: f64, amplitude: f32) -> Self {
        Self {
            format,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    /// Produce `frames` frames of audio, the same sample on every channel
    pub fn next_chunk(&mut self, frames: usize) -> Bytes {
        let mut out = Vec::with_capacity(frames * self.format.block_align() as usize);
        let step = self.frequency / self.format.sample_rate as f64;

        for _ in 0..frames {
            let value = (self.phase * TAU).sin() as f32 * self.amplitude;
            for _ in 0..self.format.channels {
                self.format.encode_sample(value, &mut out);
            }
            self.phase = (self.phase + step).fract();
        }

        Bytes::from(out)
    }
}
