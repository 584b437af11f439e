//! Fixed-slot playback buffer ring
//!
//! A small pool of buffer slots shared between a producer handing audio to
//! the device and the device playing it back. Idle slot indices live in a
//! bounded channel that doubles as the backpressure gate: `submit` takes
//! the next idle index (waiting while every slot is in flight), binds the
//! caller's bytes to it and issues the device's `prepare` and `play`.
//! `poll_completion` asks the device whether a slot has finished and, once
//! it has, releases the bytes and sends the index back to the channel.
//!
//! ```text
//!   submit ──► [idle FIFO] ──► bind ──► prepare/play ──► device (in flight)
//!                  ▲                                         │
//!                  └──────── reclaim ◄── poll_completion ◄───┘
//! ```
//!
//! Closing the ring drops the channel's only sender, which wakes any
//! producer parked in `submit` with `AudioError::RingClosed`.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::constants::DEFAULT_SLOT_COUNT;
use crate::device::{DeviceStatus, OutputDevice, SlotDescriptor};
use crate::error::{AudioError, SubmitStage};

/// Submission error code used when a device reports a buffer it was just
/// given as still playing
pub const UNEXPECTED_STILL_PLAYING: u32 = u32::MAX;

/// How driver errors reported while reclaiming a slot are handled
///
/// The slot is returned to the pool either way; a device that has reported
/// anything other than "still playing" no longer owns the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimPolicy {
    /// Return `AudioError::Reclaim` to the poller
    #[default]
    Surface,
    /// Log the status and report the slot as completed
    Lenient,
}

/// Ring construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOptions {
    pub slot_count: usize,
    pub reclaim_policy: ReclaimPolicy,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            reclaim_policy: ReclaimPolicy::default(),
        }
    }
}

/// Identifies one in-flight submission
///
/// The generation changes every time the slot is bound, so a handle kept
/// past its completion is recognised as stale instead of touching the
/// slot's next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

impl SlotHandle {
    pub fn slot_index(&self) -> usize {
        self.index
    }
}

#[derive(Default)]
struct SlotState {
    data: Option<Bytes>,
    in_flight: bool,
    generation: u64,
}

struct Slot {
    index: usize,
    next: usize,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct RingCounters {
    submitted: AtomicU64,
    reclaimed: AtomicU64,
    submit_failures: AtomicU64,
    reclaim_errors: AtomicU64,
    blocked_submits: AtomicU64,
}

/// Ring statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub slot_count: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub reclaimed: u64,
    pub submit_failures: u64,
    pub reclaim_errors: u64,
    pub blocked_submits: u64,
}

#[derive(Clone, Copy)]
enum Wait {
    Never,
    Forever,
    Timeout(Duration),
}

/// Playback buffer ring over an output device
pub struct BufferRing<D: OutputDevice> {
    device: D,
    slots: Box<[Slot]>,
    /// `None` once the ring is closed
    idle_tx: Mutex<Option<Sender<usize>>>,
    idle_rx: Receiver<usize>,
    /// Slots returned after close, when the idle queue no longer accepts them
    retired: AtomicUsize,
    /// Serializes slot acquisition and play issuance so playback order
    /// matches call order
    submit_lock: Mutex<()>,
    closed: AtomicBool,
    policy: ReclaimPolicy,
    counters: RingCounters,
}

impl<D: OutputDevice> BufferRing<D> {
    /// Build a ring of `options.slot_count` slots over an open device
    pub fn new(device: D, options: RingOptions) -> Result<Self, AudioError> {
        let count = options.slot_count;
        if count == 0 {
            return Err(AudioError::InvalidConfig("slot count must be at least 1".into()));
        }
        if count > device.slot_capacity() {
            return Err(AudioError::InvalidConfig(format!(
                "{} slots requested, device tracks {}",
                count,
                device.slot_capacity()
            )));
        }

        let slots: Box<[Slot]> = (0..count)
            .map(|index| Slot {
                index,
                next: (index + 1) % count,
                state: Mutex::new(SlotState::default()),
            })
            .collect();

        let (idle_tx, idle_rx) = bounded(count);
        for slot in slots.iter() {
            idle_tx
                .try_send(slot.index)
                .map_err(|_| AudioError::InvalidConfig("idle queue rejected a slot".into()))?;
        }

        tracing::debug!("Buffer ring created with {} slots", count);

        Ok(Self {
            device,
            slots,
            idle_tx: Mutex::new(Some(idle_tx)),
            idle_rx,
            retired: AtomicUsize::new(0),
            submit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            policy: options.reclaim_policy,
            counters: RingCounters::default(),
        })
    }

    /// Hand `data` to the device, waiting for a free slot if all are in flight
    pub fn submit(&self, data: impl Into<Bytes>) -> Result<SlotHandle, AudioError> {
        self.submit_with(data.into(), Wait::Forever)
    }

    /// Like `submit`, but fails with `Exhausted` instead of waiting
    pub fn try_submit(&self, data: impl Into<Bytes>) -> Result<SlotHandle, AudioError> {
        self.submit_with(data.into(), Wait::Never)
    }

    /// Like `submit`, but gives up with `Exhausted` after `timeout`
    pub fn submit_timeout(
        &self,
        data: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<SlotHandle, AudioError> {
        self.submit_with(data.into(), Wait::Timeout(timeout))
    }

    fn submit_with(&self, data: Bytes, wait: Wait) -> Result<SlotHandle, AudioError> {
        if data.is_empty() {
            return Err(AudioError::EmptyBuffer);
        }

        // Another producer holding the lock only means "busy" if it also
        // left no idle slot behind
        let _order = match wait {
            Wait::Forever => self.submit_lock.lock(),
            Wait::Never => match self.submit_lock.try_lock() {
                Some(guard) => guard,
                None if self.idle_rx.is_empty() => return Err(AudioError::Exhausted),
                None => self.submit_lock.lock(),
            },
            Wait::Timeout(t) => match self.submit_lock.try_lock_for(t) {
                Some(guard) => guard,
                None if self.idle_rx.is_empty() => return Err(AudioError::Exhausted),
                None => self.submit_lock.lock(),
            },
        };
        self.ensure_open()?;

        let index = self.acquire(wait)?;
        if self.is_closed() {
            self.release(index);
            return Err(AudioError::RingClosed);
        }
        self.issue(index, data)
    }

    fn acquire(&self, wait: Wait) -> Result<usize, AudioError> {
        match self.idle_rx.try_recv() {
            Ok(index) => return Ok(index),
            Err(TryRecvError::Disconnected) => return Err(AudioError::RingClosed),
            Err(TryRecvError::Empty) => {}
        }

        match wait {
            Wait::Never => Err(AudioError::Exhausted),
            Wait::Forever => {
                self.counters.blocked_submits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("All {} slots in flight, waiting", self.slots.len());
                self.idle_rx.recv().map_err(|_| AudioError::RingClosed)
            }
            Wait::Timeout(timeout) => {
                self.counters.blocked_submits.fetch_add(1, Ordering::Relaxed);
                self.idle_rx.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => AudioError::Exhausted,
                    RecvTimeoutError::Disconnected => AudioError::RingClosed,
                })
            }
        }
    }

    fn issue(&self, index: usize, data: Bytes) -> Result<SlotHandle, AudioError> {
        let slot = &self.slots[index];
        let mut state = slot.state.lock();
        debug_assert!(!state.in_flight, "slot {} handed out while in flight", index);

        state.generation = state.generation.wrapping_add(1);
        state.data = Some(data.clone());
        state.in_flight = true;
        let handle = SlotHandle {
            index,
            generation: state.generation,
        };

        let desc = SlotDescriptor::new(index, slot.next, &data);
        let failure = match self.device.prepare(&desc) {
            DeviceStatus::Ok => match self.device.play(&desc) {
                DeviceStatus::Ok => None,
                status => {
                    if let DeviceStatus::Failed(code) = self.device.unprepare(&desc) {
                        tracing::warn!("Unprepare after failed play returned {} on slot {}", code, index);
                    }
                    Some((SubmitStage::Play, status_code(status)))
                }
            },
            status => Some((SubmitStage::Prepare, status_code(status))),
        };

        if let Some((stage, code)) = failure {
            state.data = None;
            state.in_flight = false;
            drop(state);
            self.release(index);
            if self.is_closed() {
                tracing::debug!("Submission on slot {} interrupted by close", index);
                return Err(AudioError::RingClosed);
            }
            self.counters.submit_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Device rejected {} on slot {} with status {}", stage, index, code);
            return Err(AudioError::Submission { stage, code });
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Slot {} playing {} bytes", index, data.len());
        Ok(handle)
    }

    /// Check whether a submission has finished, reclaiming its slot if so
    ///
    /// Returns `Ok(false)` while the device is still playing the buffer.
    /// After `Ok(true)` (or a `Reclaim` error) the handle is spent.
    pub fn poll_completion(&self, handle: SlotHandle) -> Result<bool, AudioError> {
        self.ensure_open()?;
        let slot = self.slots.get(handle.index).ok_or(AudioError::StaleHandle)?;
        let mut state = slot.state.lock();
        if !state.in_flight || state.generation != handle.generation {
            return Err(AudioError::StaleHandle);
        }
        let Some(data) = state.data.clone() else {
            return Err(AudioError::StaleHandle);
        };

        let status = self
            .device
            .unprepare(&SlotDescriptor::new(slot.index, slot.next, &data));
        if status == DeviceStatus::StillPlaying {
            return Ok(false);
        }

        state.data = None;
        state.in_flight = false;
        drop(state);
        self.release(slot.index);
        self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Slot {} reclaimed", slot.index);

        match (status, self.policy) {
            (DeviceStatus::Failed(code), ReclaimPolicy::Surface) => {
                self.counters.reclaim_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Slot {} reclaimed after device status {}", slot.index, code);
                Err(AudioError::Reclaim { code })
            }
            (DeviceStatus::Failed(code), ReclaimPolicy::Lenient) => {
                self.counters.reclaim_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Ignoring device status {} on slot {}", code, slot.index);
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Poll `pending` front to back, dropping finished handles
    ///
    /// Stops at the first buffer still playing, since later submissions
    /// cannot have finished before it. Returns how many slots came back.
    pub fn reclaim_finished(&self, pending: &mut VecDeque<SlotHandle>) -> Result<usize, AudioError> {
        let mut reclaimed = 0;
        while let Some(&handle) = pending.front() {
            match self.poll_completion(handle) {
                Ok(false) => break,
                Ok(true) => {
                    pending.pop_front();
                    reclaimed += 1;
                }
                Err(e @ AudioError::Reclaim { .. }) => {
                    pending.pop_front();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Release the device and wake any producer waiting for a slot
    ///
    /// Buffers still in flight stay with the device. Calling `close` again
    /// does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.device.close() {
            DeviceStatus::Failed(code) => tracing::warn!("Device close returned status {}", code),
            _ => tracing::info!(
                "Buffer ring closed ({} slots still in flight)",
                self.in_flight_count()
            ),
        }

        self.idle_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_rx.len() + self.retired.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state.lock().in_flight).count()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            slot_count: self.slots.len(),
            idle: self.idle_count(),
            in_flight: self.in_flight_count(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
            submit_failures: self.counters.submit_failures.load(Ordering::Relaxed),
            reclaim_errors: self.counters.reclaim_errors.load(Ordering::Relaxed),
            blocked_submits: self.counters.blocked_submits.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<(), AudioError> {
        if self.is_closed() {
            Err(AudioError::RingClosed)
        } else {
            Ok(())
        }
    }

    fn release(&self, index: usize) {
        let idle_tx = self.idle_tx.lock();
        match idle_tx.as_ref() {
            Some(tx) => {
                if tx.try_send(index).is_err() {
                    tracing::error!("Idle queue refused slot {}", index);
                }
            }
            // Closed: the slot is idle but never handed out again
            None => {
                self.retired.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl<D: OutputDevice> Drop for BufferRing<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn status_code(status: DeviceStatus) -> u32 {
    match status {
        DeviceStatus::Failed(code) => code,
        // A device claiming a fresh buffer is still playing is a driver fault
        DeviceStatus::StillPlaying => UNEXPECTED_STILL_PLAYING,
        DeviceStatus::Ok => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn ring(slots: usize) -> (BufferRing<SimulatedDevice>, SimulatedDevice) {
        let device = SimulatedDevice::manual(slots);
        let ring = BufferRing::new(
            device.clone(),
            RingOptions {
                slot_count: slots,
                ..Default::default()
            },
        )
        .unwrap();
        (ring, device)
    }

    fn buffer(fill: u8) -> Bytes {
        Bytes::from(vec![fill; 4096])
    }

    /// Wait until `cond` holds or a second passes
    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_rejects_zero_slots() {
        let device = SimulatedDevice::manual(3);
        let result = BufferRing::new(
            device,
            RingOptions {
                slot_count: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(AudioError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_more_slots_than_device() {
        let device = SimulatedDevice::manual(2);
        let result = BufferRing::new(
            device,
            RingOptions {
                slot_count: 3,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(AudioError::InvalidConfig(_))));
    }

    #[test]
    fn test_slots_handed_out_in_index_order() {
        let (ring, _device) = ring(3);
        let handles: Vec<_> = (0..3).map(|i| ring.submit(buffer(i)).unwrap()).collect();
        let indices: Vec<_> = handles.iter().map(|h| h.slot_index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(ring.idle_count(), 0);
        assert_eq!(ring.in_flight_count(), 3);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        let (ring, device) = ring(3);
        assert_eq!(ring.submit(Bytes::new()), Err(AudioError::EmptyBuffer));
        assert!(device.played().is_empty());
        assert_eq!(ring.idle_count(), 3);
    }

    #[test]
    fn test_poll_is_idempotent_while_playing() {
        let (ring, device) = ring(3);
        let handle = ring.submit(buffer(1)).unwrap();

        for _ in 0..5 {
            assert_eq!(ring.poll_completion(handle), Ok(false));
        }
        assert_eq!(ring.in_flight_count(), 1);

        device.complete_next();
        assert_eq!(ring.poll_completion(handle), Ok(true));
        assert_eq!(ring.idle_count(), 3);
        assert_eq!(ring.poll_completion(handle), Err(AudioError::StaleHandle));
    }

    #[test]
    fn test_stale_handle_does_not_touch_reused_slot() {
        let (ring, device) = ring(1);
        let first = ring.submit(buffer(1)).unwrap();
        device.complete_next();
        assert_eq!(ring.poll_completion(first), Ok(true));

        let second = ring.submit(buffer(2)).unwrap();
        assert_eq!(first.slot_index(), second.slot_index());
        assert_eq!(ring.poll_completion(first), Err(AudioError::StaleHandle));
        assert_eq!(ring.poll_completion(second), Ok(false));
    }

    #[test]
    fn test_play_order_follows_submit_order() {
        let (ring, device) = ring(3);
        let a = ring.submit(buffer(b'A')).unwrap();
        ring.submit(buffer(b'B')).unwrap();
        ring.submit(buffer(b'C')).unwrap();

        device.complete_next();
        assert_eq!(ring.poll_completion(a), Ok(true));
        let d = ring.submit(buffer(b'D')).unwrap();
        assert_eq!(d.slot_index(), a.slot_index());

        let order: Vec<u8> = device.played().iter().map(|b| b[0]).collect();
        assert_eq!(order, b"ABCD".to_vec());
    }

    #[test]
    fn test_try_submit_reports_exhausted() {
        let (ring, _device) = ring(2);
        ring.try_submit(buffer(1)).unwrap();
        ring.try_submit(buffer(2)).unwrap();
        assert_eq!(ring.try_submit(buffer(3)), Err(AudioError::Exhausted));
        assert_eq!(
            ring.submit_timeout(buffer(3), Duration::from_millis(20)),
            Err(AudioError::Exhausted)
        );
        assert_eq!(ring.stats().blocked_submits, 1);
    }

    #[test]
    fn test_prepare_failure_returns_slot() {
        let (ring, device) = ring(3);
        device.fail_next_prepare(7);

        let err = ring.submit(buffer(1)).unwrap_err();
        assert_eq!(
            err,
            AudioError::Submission {
                stage: SubmitStage::Prepare,
                code: 7
            }
        );
        assert_eq!(ring.idle_count(), 3);
        assert_eq!(ring.in_flight_count(), 0);
        assert!(device.played().is_empty());

        // The pool is not starved: all three slots can still be used
        for i in 0..3 {
            ring.try_submit(buffer(i)).unwrap();
        }
    }

    #[test]
    fn test_play_failure_returns_slot() {
        let (ring, device) = ring(1);
        device.fail_next_play(9);

        assert_eq!(
            ring.submit(buffer(1)),
            Err(AudioError::Submission {
                stage: SubmitStage::Play,
                code: 9
            })
        );
        assert_eq!(ring.idle_count(), 1);
        let handle = ring.try_submit(buffer(2)).unwrap();
        assert_eq!(handle.slot_index(), 0);
        assert_eq!(ring.stats().submit_failures, 1);
    }

    #[test]
    fn test_reclaim_error_surfaced_and_slot_returned() {
        let (ring, device) = ring(2);
        let handle = ring.submit(buffer(1)).unwrap();
        device.complete_next();
        device.fail_next_unprepare(6);

        assert_eq!(ring.poll_completion(handle), Err(AudioError::Reclaim { code: 6 }));
        assert_eq!(ring.idle_count(), 2);
        assert_eq!(ring.stats().reclaim_errors, 1);
    }

    #[test]
    fn test_lenient_policy_treats_error_as_done() {
        let device = SimulatedDevice::manual(2);
        let ring = BufferRing::new(
            device.clone(),
            RingOptions {
                slot_count: 2,
                reclaim_policy: ReclaimPolicy::Lenient,
            },
        )
        .unwrap();
        let handle = ring.submit(buffer(1)).unwrap();
        device.complete_next();
        device.fail_next_unprepare(6);

        assert_eq!(ring.poll_completion(handle), Ok(true));
        assert_eq!(ring.idle_count(), 2);
    }

    #[test]
    fn test_reclaim_finished_stops_at_playing_buffer() {
        let (ring, device) = ring(3);
        let mut pending: VecDeque<_> = (0..3).map(|i| ring.submit(buffer(i)).unwrap()).collect();

        device.complete_next();
        assert_eq!(ring.reclaim_finished(&mut pending), Ok(1));
        assert_eq!(pending.len(), 2);

        device.complete_all();
        assert_eq!(ring.reclaim_finished(&mut pending), Ok(2));
        assert!(pending.is_empty());
        assert_eq!(ring.idle_count(), 3);
    }

    #[test]
    fn test_full_pool_blocks_until_completion() {
        let (ring, device) = ring(3);
        let ring = Arc::new(ring);

        let first = ring.submit(buffer(1)).unwrap();
        ring.submit(buffer(2)).unwrap();
        ring.submit(buffer(3)).unwrap();
        assert_eq!(ring.stats().blocked_submits, 0);

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.submit(buffer(4)))
        };

        assert!(eventually(|| ring.stats().blocked_submits == 1));
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        assert_eq!(device.played().len(), 3);

        device.complete_next();
        assert_eq!(ring.poll_completion(first), Ok(true));

        let fourth = producer.join().unwrap().unwrap();
        assert_eq!(fourth.slot_index(), first.slot_index());
        let played = device.played();
        assert_eq!(played.len(), 4);
        assert_eq!(played[3][0], 4);
        assert_eq!(played[3].len(), 4096);
    }

    #[test]
    fn test_close_releases_blocked_submit() {
        let (ring, device) = ring(1);
        let ring = Arc::new(ring);
        ring.submit(buffer(1)).unwrap();

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.submit(buffer(2)))
        };
        assert!(eventually(|| ring.stats().blocked_submits == 1));

        ring.close();
        assert!(eventually(|| producer.is_finished()));
        assert_eq!(producer.join().unwrap(), Err(AudioError::RingClosed));
        assert!(device.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ring, device) = ring(3);
        ring.submit(buffer(1)).unwrap();
        ring.close();
        ring.close();
        drop(ring);

        assert_eq!(device.close_calls(), 1);
    }

    #[test]
    fn test_operations_fail_after_close() {
        let (ring, _device) = ring(3);
        let handle = ring.submit(buffer(1)).unwrap();
        ring.close();

        assert_eq!(ring.submit(buffer(2)), Err(AudioError::RingClosed));
        assert_eq!(ring.try_submit(buffer(2)), Err(AudioError::RingClosed));
        assert_eq!(ring.poll_completion(handle), Err(AudioError::RingClosed));
    }

    #[test]
    fn test_try_submit_waits_out_another_producer() {
        let (ring, device) = ring(3);
        let ring = Arc::new(ring);
        device.set_prepare_delay(Duration::from_millis(200));

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.submit(buffer(1)))
        };
        assert!(eventually(|| ring.idle_count() == 2));

        let second = ring.try_submit(buffer(2)).unwrap();
        assert_eq!(second.slot_index(), 1);
        assert_eq!(producer.join().unwrap().unwrap().slot_index(), 0);
        assert_eq!(ring.in_flight_count(), 2);
    }

    #[test]
    fn test_close_during_submit_reports_closed() {
        let (ring, device) = ring(3);
        let ring = Arc::new(ring);
        device.set_prepare_delay(Duration::from_millis(200));

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.submit(buffer(1)))
        };
        assert!(eventually(|| ring.idle_count() == 2));
        thread::sleep(Duration::from_millis(50));

        ring.close();
        assert_eq!(producer.join().unwrap(), Err(AudioError::RingClosed));
        assert_eq!(ring.stats().submit_failures, 0);
        assert_eq!(ring.idle_count() + ring.in_flight_count(), 3);
    }

    struct BusyDevice;

    impl OutputDevice for BusyDevice {
        fn slot_capacity(&self) -> usize {
            1
        }

        fn prepare(&self, _slot: &SlotDescriptor<'_>) -> DeviceStatus {
            DeviceStatus::StillPlaying
        }

        fn play(&self, _slot: &SlotDescriptor<'_>) -> DeviceStatus {
            DeviceStatus::Ok
        }

        fn unprepare(&self, _slot: &SlotDescriptor<'_>) -> DeviceStatus {
            DeviceStatus::Ok
        }

        fn close(&self) -> DeviceStatus {
            DeviceStatus::Ok
        }
    }

    #[test]
    fn test_still_playing_on_prepare_is_a_submission_error() {
        let ring = BufferRing::new(
            BusyDevice,
            RingOptions {
                slot_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(
            ring.submit(buffer(1)),
            Err(AudioError::Submission {
                stage: SubmitStage::Prepare,
                code: UNEXPECTED_STILL_PLAYING
            })
        );
        assert_eq!(ring.idle_count(), 1);
    }

    #[test]
    fn test_concurrent_producer_and_poller() {
        let (ring, device) = ring(3);
        let ring = Arc::new(ring);
        let (tx, rx) = crossbeam_channel::unbounded::<SlotHandle>();

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..50u8 {
                    let handle = ring.submit(buffer(i)).unwrap();
                    tx.send(handle).unwrap();
                }
            })
        };

        let mut pending = VecDeque::new();
        let mut done = 0;
        while done < 50 {
            pending.extend(rx.try_iter());
            device.complete_next();
            done += ring.reclaim_finished(&mut pending).unwrap();
        }
        producer.join().unwrap();

        let order: Vec<u8> = device.played().iter().map(|b| b[0]).collect();
        assert_eq!(order, (0..50).collect::<Vec<u8>>());
        assert_eq!(ring.stats().reclaimed, 50);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit,
        Complete,
        Poll(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Submit),
            Just(Op::Complete),
            (0usize..8).prop_map(Op::Poll),
        ]
    }

    proptest! {
        #[test]
        fn prop_capacity_and_no_double_issue(slots in 1usize..6, ops in proptest::collection::vec(op(), 1..64)) {
            let (ring, device) = ring(slots);
            let mut outstanding: Vec<SlotHandle> = Vec::new();

            for op in ops {
                match op {
                    Op::Submit => match ring.try_submit(buffer(1)) {
                        Ok(handle) => {
                            prop_assert!(outstanding.iter().all(|h| h.slot_index() != handle.slot_index()));
                            outstanding.push(handle);
                        }
                        Err(e) => {
                            prop_assert_eq!(e, AudioError::Exhausted);
                            prop_assert_eq!(outstanding.len(), slots);
                        }
                    },
                    Op::Complete => {
                        device.complete_next();
                    }
                    Op::Poll(i) if !outstanding.is_empty() => {
                        let handle = outstanding[i % outstanding.len()];
                        if ring.poll_completion(handle).unwrap() {
                            outstanding.retain(|h| *h != handle);
                        }
                    }
                    Op::Poll(_) => {}
                }

                prop_assert_eq!(ring.idle_count() + ring.in_flight_count(), slots);
                prop_assert_eq!(ring.in_flight_count(), outstanding.len());
            }
        }
    }
}
