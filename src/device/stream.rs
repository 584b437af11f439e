//! Portable output backend over cpal
//!
//! A dedicated thread owns the cpal output stream, as cpal streams cannot
//! move between threads on every host. Played buffers wait in a bounded
//! queue; the output callback decodes them to `f32` strictly in queue order
//! and flags each slot as done once its last byte has been consumed.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{DeviceStatus, OutputDevice, SlotDescriptor};
use crate::audio::format::PcmFormat;
use crate::error::AudioError;

/// Status reported for calls on a closed stream
pub const STATUS_CLOSED: u32 = 5;
/// Status reported for an out-of-range slot or a slot in the wrong state
pub const STATUS_INVALID_SLOT: u32 = 11;
/// Status reported when the play queue is full
pub const STATUS_QUEUE_FULL: u32 = 7;

const IDLE: u8 = 0;
const PREPARED: u8 = 1;
const PLAYING: u8 = 2;
const DONE: u8 = 3;

struct QueuedBuffer {
    index: usize,
    data: Bytes,
}

struct StreamShared {
    queue: ArrayQueue<QueuedBuffer>,
    states: Box<[AtomicU8]>,
    running: AtomicBool,
    /// Output callbacks that ran out of queued audio
    underruns: AtomicU64,
}

impl StreamShared {
    fn transition(&self, index: usize, from: u8, to: u8) -> bool {
        self.states
            .get(index)
            .map(|s| s.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok())
            .unwrap_or(false)
    }
}

/// Buffer currently being drained by the output callback
struct Cursor {
    buffer: QueuedBuffer,
    offset: usize,
}

/// Default host output device driven through a cpal stream
pub struct CpalDevice {
    shared: Arc<StreamShared>,
    format: PcmFormat,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CpalDevice {
    /// Open the host's default output device in `format`
    pub fn open(format: PcmFormat, slot_count: usize) -> Result<Self, AudioError> {
        format.validate()?;
        let slot_count = slot_count.max(1);

        let shared = Arc::new(StreamShared {
            queue: ArrayQueue::new(slot_count),
            states: (0..slot_count).map(|_| AtomicU8::new(IDLE)).collect(),
            running: AtomicBool::new(true),
            underruns: AtomicU64::new(0),
        });

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (ready_tx, ready_rx) = bounded::<Result<String, AudioError>>(1);
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name("playback-stream".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err(AudioError::DeviceOpen(
                        "No default output device".to_string(),
                    )));
                    return;
                };
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

                let callback_shared = thread_shared.clone();
                let mut cursor: Option<Cursor> = None;
                let stream = device.build_output_stream(
                    &config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_output(&callback_shared, &format, &mut cursor, out);
                    },
                    move |err| {
                        tracing::error!("Output stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceOpen(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::DeviceOpen(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(name));

                // Keep the stream alive while running
                while thread_shared.running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping playback
            })
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                tracing::info!(
                    "Opened output '{}': {} ch, {} Hz, {} bit, {} slots",
                    name,
                    format.channels,
                    format.sample_rate,
                    format.bits_per_sample,
                    slot_count
                );
                Ok(Self {
                    shared,
                    format,
                    thread_handle: Mutex::new(Some(handle)),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::DeviceOpen("stream thread exited".to_string()))
            }
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

fn fill_output(shared: &StreamShared, format: &PcmFormat, cursor: &mut Option<Cursor>, out: &mut [f32]) {
    let width = format.bytes_per_sample();
    let mut starved = false;

    for sample in out.iter_mut() {
        if cursor.is_none() {
            *cursor = shared.queue.pop().map(|buffer| Cursor { buffer, offset: 0 });
        }
        let Some(current) = cursor.as_mut() else {
            *sample = 0.0;
            starved = true;
            continue;
        };

        *sample = format.decode_sample(&current.buffer.data[current.offset..]);
        current.offset += width;

        if current.offset >= current.buffer.data.len() {
            shared.transition(current.buffer.index, PLAYING, DONE);
            *cursor = None;
        }
    }

    if starved {
        shared.underruns.fetch_add(1, Ordering::Relaxed);
    }
}

impl OutputDevice for CpalDevice {
    fn slot_capacity(&self) -> usize {
        self.shared.states.len()
    }

    fn prepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        if !self.shared.running.load(Ordering::SeqCst) {
            return DeviceStatus::Failed(STATUS_CLOSED);
        }
        if self.shared.transition(slot.index, IDLE, PREPARED)
            || self.shared.transition(slot.index, DONE, PREPARED)
        {
            DeviceStatus::Ok
        } else {
            DeviceStatus::Failed(STATUS_INVALID_SLOT)
        }
    }

    fn play(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        if !self.shared.running.load(Ordering::SeqCst) {
            return DeviceStatus::Failed(STATUS_CLOSED);
        }
        if !self.shared.transition(slot.index, PREPARED, PLAYING) {
            return DeviceStatus::Failed(STATUS_INVALID_SLOT);
        }

        let queued = QueuedBuffer {
            index: slot.index,
            data: slot.data.clone(),
        };
        if self.shared.queue.push(queued).is_err() {
            self.shared.transition(slot.index, PLAYING, PREPARED);
            return DeviceStatus::Failed(STATUS_QUEUE_FULL);
        }
        DeviceStatus::Ok
    }

    fn unprepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let Some(state) = self.shared.states.get(slot.index) else {
            return DeviceStatus::Failed(STATUS_INVALID_SLOT);
        };
        match state.load(Ordering::Acquire) {
            PLAYING => DeviceStatus::StillPlaying,
            _ => {
                state.store(IDLE, Ordering::Release);
                DeviceStatus::Ok
            }
        }
    }

    fn close(&self) -> DeviceStatus {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
            tracing::debug!("Output stream stopped ({} underruns)", self.underruns());
        }
        DeviceStatus::Ok
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(slots: usize) -> StreamShared {
        StreamShared {
            queue: ArrayQueue::new(slots),
            states: (0..slots).map(|_| AtomicU8::new(IDLE)).collect(),
            running: AtomicBool::new(true),
            underruns: AtomicU64::new(0),
        }
    }

    fn queue(shared: &StreamShared, index: usize, data: Vec<u8>) {
        shared.states[index].store(PLAYING, Ordering::SeqCst);
        assert!(shared
            .queue
            .push(QueuedBuffer {
                index,
                data: Bytes::from(data)
            })
            .is_ok());
    }

    #[test]
    fn test_fill_output_consumes_in_order() {
        let format = PcmFormat::new(1, 8_000, 8);
        let shared = shared(2);
        queue(&shared, 0, vec![255, 255]);
        queue(&shared, 1, vec![0, 0, 0]);

        let mut cursor = None;
        let mut out = [9.0f32; 3];
        fill_output(&shared, &format, &mut cursor, &mut out);

        assert_eq!(shared.states[0].load(Ordering::SeqCst), DONE);
        assert_eq!(shared.states[1].load(Ordering::SeqCst), PLAYING);
        assert!(out[0] > 0.99 && out[1] > 0.99);
        assert_eq!(out[2], -1.0);

        let mut out = [9.0f32; 4];
        fill_output(&shared, &format, &mut cursor, &mut out);
        assert_eq!(shared.states[1].load(Ordering::SeqCst), DONE);
        assert_eq!(&out[2..], &[0.0, 0.0]);
        assert_eq!(shared.underruns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_queue_outputs_silence() {
        let format = PcmFormat::new(2, 48_000, 16);
        let shared = shared(1);
        let mut cursor = None;
        let mut out = [1.0f32; 8];
        fill_output(&shared, &format, &mut cursor, &mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
