//! Body of the isolated capture process.
//!
//! Runs in a child process (`juno capture-worker`). The cpal callback reduces
//! each frame to stereo i16 and pushes it into a lock-free ring; the worker
//! thread cuts fixed-size chunks out of the ring and writes them to stdout as
//! frames. The parent closing our stdin is the stop signal.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::{
    HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{device, ipc};
use crate::config::AudioConfig;
use crate::error::{Error, Result};

const POLL: Duration = Duration::from_millis(2);
/// Ring capacity in chunks
const RING_CHUNKS: usize = 8;

/// Peak absolute level of interleaved i16 samples relative to full scale.
pub fn peak(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .map_or(0.0, |p| p as f32 / i16::MAX as f32)
}

/// Keeps the first two channels of one interleaved frame; mono is doubled.
fn stereo_frame<T>(frame: &[T]) -> [i16; 2]
where
    T: Sample,
    i16: FromSample<T>,
{
    match frame {
        [] => [0, 0],
        [mono] => {
            let s = mono.to_sample::<i16>();
            [s, s]
        }
        [left, right, ..] => [left.to_sample::<i16>(), right.to_sample::<i16>()],
    }
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<i16>,
    overruns: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    if producer.vacant_len() < 2 {
                        overruns.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    producer.push_slice(&stereo_frame(frame));
                }
            },
            move |err| {
                error!("Input stream error: {}", err);
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| Error::ProcessStartFailure(e.to_string()))
}

/// Captures until stdin closes or the device fails. Never returns `Ok` early
/// on device trouble: a vanished device is an error so the parent sees a
/// non-zero exit.
pub fn run_worker(config: &AudioConfig) -> Result<()> {
    let (device, info) = device::open_input_device(&config.device, config.capture_channels)?;

    let channels = config.capture_channels.min(info.input_channels).max(1);
    let sample_format = device
        .default_input_config()
        .map_err(|e| Error::ProcessStartFailure(e.to_string()))?
        .sample_format();
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: config.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_samples = config.chunk_frames * AudioConfig::OUTPUT_CHANNELS as usize;
    let ring = HeapRb::<i16>::new(chunk_samples * RING_CHUNKS);
    let (producer, mut consumer) = ring.split();

    let overruns = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, producer, overruns.clone(), failed.clone())?
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, producer, overruns.clone(), failed.clone())?
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(&device, &stream_config, producer, overruns.clone(), failed.clone())?
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, producer, overruns.clone(), failed.clone())?
        }
        other => {
            return Err(Error::ProcessStartFailure(format!(
                "unsupported sample format {other:?}"
            )));
        }
    };
    stream
        .play()
        .map_err(|e| Error::ProcessStartFailure(e.to_string()))?;

    info!(
        "Capturing {} ch @ {} Hz from {}, {} frames per chunk",
        channels, config.sample_rate, info.name, config.chunk_frames
    );

    let stop_watch = stop.clone();
    thread::Builder::new()
        .name("capture-stdin".to_string())
        .spawn(move || {
            let mut sink = [0u8; 64];
            let mut stdin = io::stdin();
            while matches!(stdin.read(&mut sink), Ok(n) if n > 0) {}
            stop_watch.store(true, Ordering::Relaxed);
        })?;

    let mut stdout = io::stdout().lock();
    let mut chunk = vec![0i16; chunk_samples];
    let mut chunk_count: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        if failed.load(Ordering::Relaxed) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("input device {} failed", info.name),
            )));
        }
        if consumer.occupied_len() < chunk_samples {
            thread::sleep(POLL);
            continue;
        }

        consumer.pop_slice(&mut chunk);
        chunk_count += 1;
        if chunk_count % 50 == 1 {
            info!(
                "chunk {}: peak {:.6}, overruns {}",
                chunk_count,
                peak(&chunk),
                overruns.load(Ordering::Relaxed)
            );
        }

        if let Err(e) = ipc::write_frame(&mut stdout, &samples_to_bytes(&chunk)) {
            // Parent went away
            warn!("Chunk pipe closed: {}", e);
            break;
        }
    }

    drop(stream);
    let _ = stdout.flush();
    info!("Capture worker stopped after {} chunks", chunk_count);
    Ok(())
}
