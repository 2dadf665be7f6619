//! Pull-based audio source for realtime media transports.
//!
//! Each pull returns one frame: the next captured chunk if it arrives in
//! time, otherwise a short frame of silence. Timestamps count samples per
//! channel and advance on every frame, silent or not.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::{DropOldestQueue, SubscriberRegistry, Subscription, bytes_to_samples};
use crate::config::{AudioConfig, StreamConfig};

const DROP_REPORT_EVERY: u64 = 500;
const DROP_RATE_WARN: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Presentation timestamp in `time_base` units
    pub pts: u64,
    /// (numerator, denominator) seconds per tick
    pub time_base: (u32, u32),
}

impl AudioFrame {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0)
    }
}

pub struct TrackAdapter {
    queue: Arc<DropOldestQueue<Bytes>>,
    subscription: Mutex<Option<Subscription>>,
    received: Arc<AtomicU64>,
    sample_rate: u32,
    channels: u16,
    pull_timeout: Duration,
    silence_frames: usize,
    pts: Mutex<u64>,
}

impl TrackAdapter {
    pub fn new(registry: Arc<SubscriberRegistry>, audio: &AudioConfig, stream: &StreamConfig) -> Self {
        let queue = Arc::new(DropOldestQueue::new(stream.track_queue_capacity));
        let keep = stream
            .track_queue_capacity
            .saturating_sub(stream.track_headroom)
            .max(1);
        let received = Arc::new(AtomicU64::new(0));

        let feed = queue.clone();
        let counter = received.clone();
        let subscription = Subscription::new(registry, move |chunk| {
            if chunk.is_empty() {
                return Ok(());
            }
            feed.push_keeping(chunk.clone(), keep);
            let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if total % DROP_REPORT_EVERY == 0 {
                let rate = feed.dropped() as f64 / total as f64;
                if rate > DROP_RATE_WARN {
                    warn!(
                        "Track adapter dropped {} of {} frames ({:.1}%)",
                        feed.dropped(),
                        total,
                        rate * 100.0
                    );
                }
            }
            Ok(())
        });
        debug!("Track adapter subscribed ({})", subscription.id());

        Self {
            queue,
            subscription: Mutex::new(Some(subscription)),
            received,
            sample_rate: audio.sample_rate,
            channels: AudioConfig::OUTPUT_CHANNELS,
            pull_timeout: Duration::from_millis(stream.pull_timeout_ms),
            silence_frames: (audio.sample_rate as u64 * stream.silence_frame_ms as u64 / 1000)
                as usize,
            pts: Mutex::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Next frame, waiting at most the pull timeout before falling back to
    /// silence. `None` once the adapter is stopped.
    pub async fn recv(&self) -> Option<AudioFrame> {
        if !self.is_active() {
            return None;
        }
        let chunk = tokio::time::timeout(self.pull_timeout, self.queue.pop())
            .await
            .ok();
        Some(self.frame(chunk))
    }

    /// Blocking counterpart of [`recv`](Self::recv).
    pub fn recv_blocking(&self) -> Option<AudioFrame> {
        if !self.is_active() {
            return None;
        }
        let chunk = self.queue.pop_timeout(self.pull_timeout);
        Some(self.frame(chunk))
    }

    fn frame(&self, chunk: Option<Bytes>) -> AudioFrame {
        let samples = match chunk {
            Some(chunk) => bytes_to_samples(&chunk),
            None => vec![0; self.silence_frames * self.channels as usize],
        };
        let frames = (samples.len() / self.channels as usize) as u64;

        let mut pts = self.pts.lock();
        let frame = AudioFrame {
            samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
            pts: *pts,
            time_base: (1, self.sample_rate),
        };
        *pts += frames;
        frame
    }

    /// (frames received, frames dropped on overflow)
    pub fn stats(&self) -> (u64, u64) {
        (self.received.load(Ordering::Relaxed), self.queue.dropped())
    }

    /// Unsubscribes and releases queued audio.
    pub fn stop(&self) {
        if self.subscription.lock().take().is_some() {
            self.queue.clear();
            let (total, dropped) = self.stats();
            debug!("Track adapter stopped ({} frames, {} dropped)", total, dropped);
        }
    }
}

impl Drop for TrackAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_bytes;
    use std::time::Instant;

    fn adapter(sample_rate: u32) -> (TrackAdapter, Arc<SubscriberRegistry>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let audio = AudioConfig {
            sample_rate,
            ..AudioConfig::default()
        };
        let track = TrackAdapter::new(registry.clone(), &audio, &StreamConfig::default());
        (track, registry)
    }

    #[tokio::test]
    async fn test_silence_on_underrun() {
        let (track, _registry) = adapter(48000);

        let started = Instant::now();
        let frame = track.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(frame.is_silent());
        assert_eq!(frame.frames(), 48000 / 50);
        assert_eq!(frame.pts, 0);

        let next = track.recv().await.unwrap();
        assert_eq!(next.pts, 960);
    }

    #[tokio::test]
    async fn test_chunk_frames_advance_pts() {
        let (track, registry) = adapter(44100);
        let chunk = samples_to_bytes(&[5; 2048]);
        registry.dispatch(&Bytes::from(chunk.clone()));
        registry.dispatch(&Bytes::from(chunk));

        let first = track.recv().await.unwrap();
        assert_eq!(first.frames(), 1024);
        assert_eq!(first.time_base, (1, 44100));
        assert!(!first.is_silent());
        let second = track.recv().await.unwrap();
        assert_eq!(second.pts, 1024);
    }

    #[test]
    fn test_empty_chunks_are_skipped() {
        let (track, registry) = adapter(44100);
        registry.dispatch(&Bytes::new());
        registry.dispatch(&Bytes::from(samples_to_bytes(&[7; 8])));
        assert_eq!(track.stats(), (1, 0));

        let first = track.recv_blocking().unwrap();
        assert_eq!(first.frames(), 4);
        assert_eq!(first.pts, 0);
    }

    #[test]
    fn test_overflow_keeps_headroom() {
        let (track, registry) = adapter(44100);
        for i in 0..10i16 {
            registry.dispatch(&Bytes::from(samples_to_bytes(&[i, i])));
        }
        assert_eq!(track.stats(), (10, 4));

        let first = track.recv_blocking().unwrap();
        assert_eq!(first.samples, vec![4, 4]);
    }

    #[test]
    fn test_stop_unsubscribes() {
        let (track, registry) = adapter(44100);
        assert_eq!(registry.len(), 1);
        track.stop();
        assert!(registry.is_empty());
        assert!(track.recv_blocking().is_none());
        track.stop();
    }
}
