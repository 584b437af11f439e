//! Software output device
//!
//! Behaves like a driver that plays buffers strictly in queue order. In
//! manual mode nothing finishes until the owner calls `complete_next`; in
//! realtime mode each buffer finishes once its PCM duration has elapsed on
//! the wall clock. Failure codes can be injected for any device call.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DeviceStatus, OutputDevice, SlotDescriptor};
use crate::audio::format::PcmFormat;
use crate::error::AudioError;

/// Status reported for calls on a closed device
pub const STATUS_INVALID_HANDLE: u32 = 5;
/// Status reported for an out-of-range slot or a busy slot
pub const STATUS_INVALID_PARAM: u32 = 11;
/// Status reported when `play` is issued for an unprepared slot
pub const STATUS_UNPREPARED: u32 = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimSlot {
    Idle,
    Prepared,
    Playing,
    Done,
}

enum Clock {
    Manual,
    Realtime {
        format: PcmFormat,
        /// When the buffer at the head of the queue started playing
        head_started: Option<Instant>,
    },
}

struct SimState {
    slots: Vec<SimSlot>,
    /// Playing slots in playback order, with their durations
    queue: VecDeque<(usize, Duration)>,
    played: Vec<Bytes>,
    prepare_failures: VecDeque<u32>,
    play_failures: VecDeque<u32>,
    unprepare_failures: VecDeque<u32>,
    /// Time `prepare` spends before touching the slot
    prepare_delay: Duration,
    clock: Clock,
    closed: bool,
    close_calls: usize,
}

impl SimState {
    fn finish_head(&mut self) -> Option<usize> {
        let (index, _) = self.queue.pop_front()?;
        self.slots[index] = SimSlot::Done;
        Some(index)
    }

    fn advance(&mut self, now: Instant) {
        let Clock::Realtime { head_started, .. } = &mut self.clock else {
            return;
        };

        loop {
            let Some(&(index, duration)) = self.queue.front() else {
                break;
            };
            let Some(started) = *head_started else {
                break;
            };
            let ends = started + duration;
            if now < ends {
                break;
            }
            self.queue.pop_front();
            self.slots[index] = SimSlot::Done;
            *head_started = if self.queue.is_empty() { None } else { Some(ends) };
        }
    }
}

/// In-process output device; clones share the same state
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Device whose buffers finish only through `complete_next`
    pub fn manual(slot_count: usize) -> Self {
        Self::with_clock(slot_count, Clock::Manual)
    }

    /// Device whose buffers finish after their playback time
    pub fn realtime(format: PcmFormat, slot_count: usize) -> Result<Self, AudioError> {
        format
            .validate()
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))?;
        tracing::info!(
            "Opened simulated device: {} ch, {} Hz, {} bit",
            format.channels,
            format.sample_rate,
            format.bits_per_sample
        );
        Ok(Self::with_clock(
            slot_count,
            Clock::Realtime {
                format,
                head_started: None,
            },
        ))
    }

    fn with_clock(slot_count: usize, clock: Clock) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                slots: vec![SimSlot::Idle; slot_count],
                queue: VecDeque::with_capacity(slot_count),
                played: Vec::new(),
                prepare_failures: VecDeque::new(),
                play_failures: VecDeque::new(),
                unprepare_failures: VecDeque::new(),
                prepare_delay: Duration::ZERO,
                clock,
                closed: false,
                close_calls: 0,
            })),
        }
    }

    /// Finish the buffer at the head of the playback queue
    pub fn complete_next(&self) -> Option<usize> {
        self.state.lock().finish_head()
    }

    /// Finish every queued buffer, returning how many finished
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut finished = 0;
        while state.finish_head().is_some() {
            finished += 1;
        }
        finished
    }

    /// Every buffer passed to `play`, in issue order
    pub fn played(&self) -> Vec<Bytes> {
        self.state.lock().played.clone()
    }

    /// Drain the play log
    pub fn take_played(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().played)
    }

    pub fn playing_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn fail_next_prepare(&self, code: u32) {
        self.state.lock().prepare_failures.push_back(code);
    }

    pub fn fail_next_play(&self, code: u32) {
        self.state.lock().play_failures.push_back(code);
    }

    /// Make the next completed `unprepare` report `code` instead of success
    pub fn fail_next_unprepare(&self, code: u32) {
        self.state.lock().unprepare_failures.push_back(code);
    }

    /// Make every `prepare` take at least `delay`, like a slow driver
    pub fn set_prepare_delay(&self, delay: Duration) {
        self.state.lock().prepare_delay = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl OutputDevice for SimulatedDevice {
    fn slot_capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    fn prepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let delay = self.state.lock().prepare_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.closed {
            return DeviceStatus::Failed(STATUS_INVALID_HANDLE);
        }
        if let Some(code) = state.prepare_failures.pop_front() {
            return DeviceStatus::Failed(code);
        }
        match state.slots.get_mut(slot.index) {
            Some(s) if matches!(*s, SimSlot::Idle | SimSlot::Done) => {
                *s = SimSlot::Prepared;
                DeviceStatus::Ok
            }
            _ => DeviceStatus::Failed(STATUS_INVALID_PARAM),
        }
    }

    fn play(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let mut state = self.state.lock();
        if state.closed {
            return DeviceStatus::Failed(STATUS_INVALID_HANDLE);
        }
        if let Some(code) = state.play_failures.pop_front() {
            return DeviceStatus::Failed(code);
        }
        if state.slots.get(slot.index) != Some(&SimSlot::Prepared) {
            return DeviceStatus::Failed(STATUS_UNPREPARED);
        }

        let now = Instant::now();
        state.advance(now);
        let duration = match &mut state.clock {
            Clock::Manual => Duration::ZERO,
            Clock::Realtime {
                format,
                head_started,
            } => {
                head_started.get_or_insert(now);
                format.duration_of(slot.len())
            }
        };

        state.slots[slot.index] = SimSlot::Playing;
        state.queue.push_back((slot.index, duration));
        state.played.push(slot.data.clone());
        DeviceStatus::Ok
    }

    fn unprepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let mut state = self.state.lock();
        if state.closed {
            return DeviceStatus::Failed(STATUS_INVALID_HANDLE);
        }
        state.advance(Instant::now());

        match state.slots.get(slot.index).copied() {
            None => DeviceStatus::Failed(STATUS_INVALID_PARAM),
            Some(SimSlot::Playing) => DeviceStatus::StillPlaying,
            Some(_) => {
                state.slots[slot.index] = SimSlot::Idle;
                match state.unprepare_failures.pop_front() {
                    Some(code) => DeviceStatus::Failed(code),
                    None => DeviceStatus::Ok,
                }
            }
        }
    }

    fn close(&self) -> DeviceStatus {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if !state.closed {
            state.closed = true;
            tracing::debug!("Simulated device closed with {} buffers queued", state.queue.len());
        }
        DeviceStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_plays_in_order() {
        let device = SimulatedDevice::manual(2);
        let a = Bytes::from_static(b"aa");
        let b = Bytes::from_static(b"bb");
        let slot_a = SlotDescriptor::new(0, 1, &a);
        let slot_b = SlotDescriptor::new(1, 0, &b);

        assert!(device.prepare(&slot_a).is_ok());
        assert!(device.play(&slot_a).is_ok());
        assert!(device.prepare(&slot_b).is_ok());
        assert!(device.play(&slot_b).is_ok());

        assert_eq!(device.unprepare(&slot_a), DeviceStatus::StillPlaying);
        assert_eq!(device.complete_next(), Some(0));
        assert_eq!(device.unprepare(&slot_a), DeviceStatus::Ok);
        assert_eq!(device.unprepare(&slot_b), DeviceStatus::StillPlaying);
        assert_eq!(device.played(), vec![a.clone(), b.clone()]);
    }

    #[test]
    fn test_play_requires_prepare() {
        let device = SimulatedDevice::manual(1);
        let data = Bytes::from_static(b"x");
        let slot = SlotDescriptor::new(0, 0, &data);
        assert_eq!(device.play(&slot), DeviceStatus::Failed(STATUS_UNPREPARED));
    }

    #[test]
    fn test_realtime_finishes_after_duration() {
        // 1 ch, 1 kHz, 8 bit: 10 bytes play for 10 ms
        let device = SimulatedDevice::realtime(PcmFormat::new(1, 1_000, 8), 1).unwrap();
        let data = Bytes::from(vec![128u8; 10]);
        let slot = SlotDescriptor::new(0, 0, &data);

        assert!(device.prepare(&slot).is_ok());
        assert!(device.play(&slot).is_ok());
        assert_eq!(device.unprepare(&slot), DeviceStatus::StillPlaying);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(device.unprepare(&slot), DeviceStatus::Ok);
    }

    #[test]
    fn test_close_is_repeatable() {
        let device = SimulatedDevice::manual(1);
        assert!(device.close().is_ok());
        assert!(device.close().is_ok());
        assert!(device.is_closed());
        assert_eq!(device.close_calls(), 2);
    }
}
