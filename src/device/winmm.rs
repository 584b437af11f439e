//! Windows multimedia (waveOut) backend
//!
//! Each slot owns one `WAVEHDR` at a fixed heap address for the life of the
//! device. The headers are chained through `lpNext` into a cycle when the
//! device is opened. No completion callback is registered; the ring polls
//! `waveOutUnprepareHeader`, which fails with `WAVERR_STILLPLAYING` until the
//! driver has finished with a header. Closing resets the device, so the
//! driver never reads a buffer after the ring has dropped it.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::size_of;
use windows::core::PSTR;
use windows::Win32::Media::Audio::{
    waveOutClose, waveOutOpen, waveOutPrepareHeader, waveOutReset, waveOutUnprepareHeader,
    waveOutWrite, CALLBACK_NULL, HWAVEOUT, WAVEFORMATEX, WAVEHDR, WAVE_FORMAT_PCM, WAVE_MAPPER,
};

use super::{DeviceStatus, OutputDevice, SlotDescriptor};
use crate::audio::format::PcmFormat;
use crate::error::AudioError;

const MMSYSERR_NOERROR: u32 = 0;
const MMSYSERR_INVALHANDLE: u32 = 5;
const MMSYSERR_INVALPARAM: u32 = 11;
const WAVERR_STILLPLAYING: u32 = 33;

fn map_status(result: u32) -> DeviceStatus {
    match result {
        MMSYSERR_NOERROR => DeviceStatus::Ok,
        WAVERR_STILLPLAYING => DeviceStatus::StillPlaying,
        code => DeviceStatus::Failed(code),
    }
}

/// waveOut stream on the system default output (`WAVE_MAPPER`)
pub struct WaveOutDevice {
    /// `None` once closed
    handle: Mutex<Option<HWAVEOUT>>,
    headers: Box<[UnsafeCell<WAVEHDR>]>,
}

// SAFETY: the handle is only used under its mutex, and each header is only
// touched by the thread holding the matching slot of the buffer ring, which
// never issues overlapping calls for one slot index.
unsafe impl Send for WaveOutDevice {}
unsafe impl Sync for WaveOutDevice {}

impl WaveOutDevice {
    pub fn open(format: PcmFormat, slot_count: usize) -> Result<Self, AudioError> {
        format.validate()?;
        let slot_count = slot_count.max(1);

        let headers: Box<[UnsafeCell<WAVEHDR>]> = (0..slot_count)
            .map(|_| UnsafeCell::new(WAVEHDR::default()))
            .collect();
        for (i, header) in headers.iter().enumerate() {
            let next = headers[(i + 1) % slot_count].get();
            // SAFETY: no header has been handed to the driver yet
            unsafe { (*header.get()).lpNext = next };
        }

        let wfx = WAVEFORMATEX {
            wFormatTag: WAVE_FORMAT_PCM as u16,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate,
            nAvgBytesPerSec: format.avg_bytes_per_sec(),
            nBlockAlign: format.block_align(),
            wBitsPerSample: format.bits_per_sample,
            cbSize: 0,
        };

        let mut handle = HWAVEOUT::default();
        // SAFETY: `handle` and `wfx` outlive the call
        let result = unsafe { waveOutOpen(Some(&mut handle), WAVE_MAPPER, &wfx, 0, 0, CALLBACK_NULL) };
        if result != MMSYSERR_NOERROR {
            return Err(AudioError::DeviceOpen(format!("waveOutOpen returned {}", result)));
        }

        tracing::info!(
            "Opened waveOut: {} ch, {} Hz, {} bit, {} slots",
            format.channels,
            format.sample_rate,
            format.bits_per_sample,
            slot_count
        );

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            headers,
        })
    }

    fn header(&self, slot: &SlotDescriptor<'_>) -> Option<*mut WAVEHDR> {
        self.headers.get(slot.index).map(UnsafeCell::get)
    }
}

impl OutputDevice for WaveOutDevice {
    fn slot_capacity(&self) -> usize {
        self.headers.len()
    }

    fn prepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let guard = self.handle.lock();
        let (Some(handle), Some(header)) = (*guard, self.header(slot)) else {
            return DeviceStatus::Failed(MMSYSERR_INVALHANDLE);
        };
        let Ok(length) = u32::try_from(slot.len()) else {
            return DeviceStatus::Failed(MMSYSERR_INVALPARAM);
        };

        // SAFETY: the slot is idle, so the driver does not own this header,
        // and the ring keeps `slot.data` alive until the header is unprepared
        unsafe {
            let hdr = &mut *header;
            hdr.lpData = PSTR(slot.data.as_ptr() as *mut u8);
            hdr.dwBufferLength = length;
            hdr.dwBytesRecorded = 0;
            hdr.dwFlags = 0;
            hdr.dwLoops = 0;
            map_status(waveOutPrepareHeader(handle, header, size_of::<WAVEHDR>() as u32))
        }
    }

    fn play(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let guard = self.handle.lock();
        let (Some(handle), Some(header)) = (*guard, self.header(slot)) else {
            return DeviceStatus::Failed(MMSYSERR_INVALHANDLE);
        };
        // SAFETY: header was prepared for this handle
        unsafe { map_status(waveOutWrite(handle, header, size_of::<WAVEHDR>() as u32)) }
    }

    fn unprepare(&self, slot: &SlotDescriptor<'_>) -> DeviceStatus {
        let guard = self.handle.lock();
        let (Some(handle), Some(header)) = (*guard, self.header(slot)) else {
            return DeviceStatus::Failed(MMSYSERR_INVALHANDLE);
        };
        // SAFETY: header belongs to this device; the driver rejects it with
        // WAVERR_STILLPLAYING while it is queued
        unsafe { map_status(waveOutUnprepareHeader(handle, header, size_of::<WAVEHDR>() as u32)) }
    }

    fn close(&self) -> DeviceStatus {
        let Some(handle) = self.handle.lock().take() else {
            return DeviceStatus::Ok;
        };
        // Reset first so the driver lets go of queued headers before their
        // buffers can be freed
        // SAFETY: handle came from waveOutOpen and is closed exactly once
        unsafe {
            let reset = waveOutReset(handle);
            if reset != MMSYSERR_NOERROR {
                tracing::warn!("waveOutReset returned {}", reset);
            }
            map_status(waveOutClose(handle))
        }
    }
}

impl Drop for WaveOutDevice {
    fn drop(&mut self) {
        self.close();
    }
}
