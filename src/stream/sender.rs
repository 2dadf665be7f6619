//! Per-client send loop.
//!
//! Each client gets its own small drop-oldest queue fed by a dispatcher
//! subscription, a sender task that drains it onto the socket, and a
//! receiver task that turns the client's buffer reports into throttle state.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::throttle::Throttle;
use crate::audio::{DropOldestQueue, SubscriberRegistry, Subscription};
use crate::config::{AudioConfig, StreamConfig};

pub const STREAM_VERSION: u32 = 1;

/// First message on every stream connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfigMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_frames: usize,
    pub bytes_per_sample: usize,
    pub sample_format: String,
    pub interleaved: bool,
    pub stream_version: u32,
}

impl AudioConfigMessage {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            kind: "audio_config".to_string(),
            sample_rate: audio.sample_rate,
            channels: AudioConfig::OUTPUT_CHANNELS,
            chunk_frames: audio.chunk_frames,
            bytes_per_sample: AudioConfig::BYTES_PER_SAMPLE,
            sample_format: "s16le".to_string(),
            interleaved: true,
            stream_version: STREAM_VERSION,
        }
    }
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    BufferStatus {
        buffer_ms: f64,
        #[serde(default)]
        target_ms: Option<f64>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub sent: u64,
    /// Chunks drained while throttled
    pub skipped: u64,
    /// Chunks evicted from the client queue
    pub dropped: u64,
}

/// Serves one client until it disconnects or a send fails.
pub async fn run_client<W, R>(
    mut write: W,
    mut read: R,
    peer: String,
    registry: Arc<SubscriberRegistry>,
    audio: &AudioConfig,
    stream: &StreamConfig,
) -> ClientStats
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let hello = match serde_json::to_string(&AudioConfigMessage::new(audio)) {
        Ok(json) => json,
        Err(e) => {
            warn!("{}: cannot encode audio config: {}", peer, e);
            return ClientStats::default();
        }
    };
    if let Err(e) = write.send(Message::text(hello)).await {
        debug!("{}: closed before config was sent: {}", peer, e);
        return ClientStats::default();
    }

    let queue = Arc::new(DropOldestQueue::new(stream.queue_capacity));
    let feed = queue.clone();
    let subscription = Subscription::new(registry, move |chunk| {
        feed.push(chunk.clone());
        Ok(())
    });
    info!("{}: streaming ({})", peer, subscription.id());

    let throttled = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(Counters::default());

    let mut sender = tokio::spawn({
        let queue = queue.clone();
        let throttled = throttled.clone();
        let counters = counters.clone();
        let peer = peer.clone();
        async move {
            loop {
                let chunk = queue.pop().await;
                if throttled.load(Ordering::Relaxed) {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if let Err(e) = write.send(Message::binary(chunk)).await {
                    debug!("{}: send failed: {}", peer, e);
                    break;
                }
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let mut receiver = tokio::spawn({
        let throttled = throttled.clone();
        let mut throttle = Throttle::new(stream.watermarks);
        let peer = peer.clone();
        async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::BufferStatus {
                            buffer_ms,
                            target_ms,
                        }) => {
                            let was = throttled.load(Ordering::Relaxed);
                            let now = throttle.update(buffer_ms, target_ms);
                            if now != was {
                                let (low, high) = throttle.watermarks();
                                debug!(
                                    "{}: throttle {} at {:.0}ms (low {:.0}, high {:.0})",
                                    peer,
                                    if now { "on" } else { "off" },
                                    buffer_ms,
                                    low,
                                    high
                                );
                            }
                            throttled.store(now, Ordering::Relaxed);
                        }
                        Err(e) => debug!("{}: ignoring message: {}", peer, e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("{}: read failed: {}", peer, e);
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut sender => receiver.abort(),
        _ = &mut receiver => sender.abort(),
    }
    drop(subscription);

    let stats = ClientStats {
        sent: counters.sent.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        dropped: queue.dropped(),
    };
    info!(
        "{}: disconnected ({} sent, {} skipped, {} dropped)",
        peer, stats.sent, stats.skipped, stats.dropped
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_message() {
        let audio = AudioConfig {
            sample_rate: 48000,
            chunk_frames: 960,
            ..AudioConfig::default()
        };
        let json: serde_json::Value =
            serde_json::to_value(AudioConfigMessage::new(&audio)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "audio_config",
                "sample_rate": 48000,
                "channels": 2,
                "chunk_frames": 960,
                "bytes_per_sample": 2,
                "sample_format": "s16le",
                "interleaved": true,
                "stream_version": 1,
            })
        );
    }

    #[test]
    fn test_parse_buffer_status() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"buffer_status","buffer_ms":120.5,"target_ms":90}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::BufferStatus {
                buffer_ms: 120.5,
                target_ms: Some(90.0)
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"buffer_status","buffer_ms":10}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::BufferStatus {
                buffer_ms: 10.0,
                target_ms: None
            }
        );

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"hello"}"#).is_err());
    }
}
