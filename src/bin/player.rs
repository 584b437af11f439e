//! Tone Player
//!
//! Streams a generated sine tone through the buffer ring to an output
//! device. Usage:
//!
//! ```text
//! player [--config PATH] [--backend waveout|cpal|simulated]
//!        [--seconds N] [--frequency HZ] [--amplitude 0..1]
//! ```

use anyhow::{bail, Context, Result};
use crossbeam_channel::TryRecvError;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waveout_ring::{
    audio::{BufferRing, RingStats, SlotHandle, ToneGenerator},
    config::{AppConfig, BackendKind, PlaybackConfig},
    device::{OutputDevice, SimulatedDevice},
    AudioError,
};

struct Args {
    config: Option<PathBuf>,
    backend: Option<BackendKind>,
    seconds: f64,
    frequency: f64,
    amplitude: f32,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        backend: None,
        seconds: 3.0,
        frequency: 440.0,
        amplitude: 0.25,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().with_context(|| format!("{} needs a value", flag));
        match flag.as_str() {
            "--config" => args.config = Some(PathBuf::from(value()?)),
            "--backend" => {
                args.backend = Some(match value()?.as_str() {
                    "waveout" => BackendKind::WaveOut,
                    "cpal" => BackendKind::Cpal,
                    "simulated" => BackendKind::Simulated,
                    other => bail!("Unknown backend: {}", other),
                })
            }
            "--seconds" => args.seconds = value()?.parse().context("Invalid --seconds")?,
            "--frequency" => args.frequency = value()?.parse().context("Invalid --frequency")?,
            "--amplitude" => args.amplitude = value()?.parse().context("Invalid --amplitude")?,
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.playback.backend = backend;
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let playback = config.playback.clone();
    tracing::info!(
        "Playing {:.1}s of {} Hz via {:?} ({} slots of {} bytes)",
        args.seconds,
        args.frequency,
        playback.backend,
        playback.slot_count,
        playback.buffer_bytes()
    );

    let stats = match playback.backend {
        BackendKind::Simulated => {
            let device = SimulatedDevice::realtime(playback.format, playback.slot_count)?;
            run(device, &playback, &args).await?
        }
        #[cfg(feature = "audio-cpal")]
        BackendKind::Cpal => {
            let device = waveout_ring::device::CpalDevice::open(playback.format, playback.slot_count)?;
            run(device, &playback, &args).await?
        }
        #[cfg(not(feature = "audio-cpal"))]
        BackendKind::Cpal => bail!("Built without the audio-cpal feature"),
        #[cfg(windows)]
        BackendKind::WaveOut => {
            let device =
                waveout_ring::device::WaveOutDevice::open(playback.format, playback.slot_count)?;
            run(device, &playback, &args).await?
        }
        #[cfg(not(windows))]
        BackendKind::WaveOut => bail!("The waveout backend is only available on Windows"),
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn run<D: OutputDevice + 'static>(
    device: D,
    playback: &PlaybackConfig,
    args: &Args,
) -> Result<RingStats> {
    let ring = Arc::new(BufferRing::new(device, playback.ring_options())?);
    let (pending_tx, pending_rx) = crossbeam_channel::unbounded::<SlotHandle>();

    let frames_per_buffer = playback.buffer_bytes() / playback.format.block_align() as usize;
    let total_frames = (args.seconds.max(0.0) * playback.format.sample_rate as f64) as usize;

    // Producer: blocks inside submit whenever every slot is in flight
    let producer = {
        let ring = ring.clone();
        let mut tone = ToneGenerator::new(playback.format, args.frequency, args.amplitude);
        tokio::task::spawn_blocking(move || -> Result<(), AudioError> {
            let mut remaining = total_frames;
            while remaining > 0 {
                let frames = remaining.min(frames_per_buffer);
                let handle = ring.submit(tone.next_chunk(frames))?;
                if pending_tx.send(handle).is_err() {
                    break;
                }
                remaining -= frames;
            }
            Ok(())
        })
    };

    // Poller: reclaims finished slots until the producer is done and
    // nothing is left in flight
    let mut poller = {
        let ring = ring.clone();
        let interval = playback.poll_interval();
        tokio::spawn(async move {
            let mut pending = VecDeque::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let producer_done = loop {
                    match pending_rx.try_recv() {
                        Ok(handle) => pending.push_back(handle),
                        Err(TryRecvError::Empty) => break false,
                        Err(TryRecvError::Disconnected) => break true,
                    }
                };

                match ring.reclaim_finished(&mut pending) {
                    Ok(_) => {}
                    Err(AudioError::Reclaim { code }) => {
                        tracing::warn!("Slot reclaimed after device status {}", code);
                    }
                    Err(AudioError::RingClosed) => break,
                    Err(e) => {
                        tracing::error!("Polling failed: {}", e);
                        break;
                    }
                }

                if producer_done && pending.is_empty() {
                    break;
                }
            }
        })
    };

    let produced = tokio::select! {
        result = producer => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing device");
            ring.close();
            Err(AudioError::RingClosed)
        }
    };

    match produced {
        Ok(()) => {
            tracing::info!("All audio submitted, waiting for playback to finish");
            tokio::select! {
                _ = &mut poller => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, closing device");
                    ring.close();
                }
            }
        }
        Err(AudioError::RingClosed) => {}
        Err(e) => {
            ring.close();
            let _ = poller.await;
            return Err(e.into());
        }
    }

    ring.close();
    Ok(ring.stats())
}
