use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// How the capture process picks its input device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Position in the host's input device list
    Index(usize),
    /// Case-insensitive substring of the device name
    Name(String),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Index(i) => write!(f, "#{i}"),
            DeviceSelector::Name(name) => write!(f, "'{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Channels requested from the device; only the first two are kept.
    pub capture_channels: u16,
    /// Frames per PCM chunk
    pub chunk_frames: usize,
    /// Chunks the dispatcher lets pile up before discarding the oldest
    pub max_backlog: usize,
    /// Capacity of the queue fed by the capture process
    pub ipc_capacity: usize,
    pub device: DeviceSelector,
}

impl AudioConfig {
    /// Channels in every PCM chunk leaving the capture process.
    pub const OUTPUT_CHANNELS: u16 = 2;
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_frames * Self::OUTPUT_CHANNELS as usize * Self::BYTES_PER_SAMPLE
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            capture_channels: 8,
            chunk_frames: 1024,
            max_backlog: 4,
            ipc_capacity: 100,
            device: DeviceSelector::Name("MONTAGE".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind: SocketAddr,
    /// Per-client chunk queue
    pub queue_capacity: usize,
    pub watermarks: WatermarkConfig,
    pub track_queue_capacity: usize,
    /// Track adapter keeps this many slots free for bursts
    pub track_headroom: usize,
    pub pull_timeout_ms: u64,
    pub silence_frame_ms: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8765)),
            queue_capacity: 8,
            watermarks: WatermarkConfig::default(),
            track_queue_capacity: 8,
            track_headroom: 2,
            pull_timeout_ms: 500,
            silence_frame_ms: 20,
        }
    }
}

/// Client-buffer thresholds for the stream throttle, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub low_ms: f64,
    pub high_ms: f64,
    /// Lowest low watermark a client target can produce
    pub floor_ms: f64,
    /// low = target - below_target_ms
    pub below_target_ms: f64,
    /// high is at least low + min_gap_ms
    pub min_gap_ms: f64,
    /// high = target + above_target_ms
    pub above_target_ms: f64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            low_ms: 80.0,
            high_ms: 160.0,
            floor_ms: 40.0,
            below_target_ms: 15.0,
            min_gap_ms: 40.0,
            above_target_ms: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JunoConfig {
    /// Substring of the MIDI output port name
    pub midi_port: String,
    pub audio: AudioConfig,
    pub stream: StreamConfig,
}

impl Default for JunoConfig {
    fn default() -> Self {
        Self {
            midi_port: "MONTAGE".to_string(),
            audio: AudioConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl JunoConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        ron::from_str(&ron_string).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bytes() {
        let audio = AudioConfig {
            chunk_frames: 960,
            ..AudioConfig::default()
        };
        assert_eq!(audio.chunk_bytes(), 960 * 2 * 2);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: JunoConfig =
            ron::from_str(r#"(midi_port: "Port1", audio: (sample_rate: 48000, device: Index(2)))"#)
                .unwrap();
        assert_eq!(config.midi_port, "Port1");
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.device, DeviceSelector::Index(2));
        assert_eq!(config.audio.chunk_frames, 1024);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("juno.ron");

        let mut config = JunoConfig::default();
        config.stream.watermarks.high_ms = 150.0;
        config.save(&path).unwrap();

        assert_eq!(JunoConfig::load(&path).unwrap(), config);
        assert_eq!(
            JunoConfig::load_or_default(&dir.path().join("missing.ron")).unwrap(),
            JunoConfig::default()
        );
    }
}
