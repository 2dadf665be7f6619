use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const MIN_BPM: u32 = 40;
pub const MAX_BPM: u32 = 200;
pub const MAX_BARS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundType {
    Bass,
    Pad,
    Lead,
}

impl SoundType {
    /// Fixed wire channel for each sound.
    pub fn channel(self) -> u8 {
        match self {
            SoundType::Bass => 0,
            SoundType::Pad => 1,
            SoundType::Lead => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SoundType::Bass => "bass",
            SoundType::Pad => "pad",
            SoundType::Lead => "lead",
        }
    }
}

/// A synth preset reference: bank select MSB/LSB plus program number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub name: String,
    pub bank_msb: u8,
    pub bank_lsb: u8,
    pub program: u8,
}

/// One pitch name, or several sounding together as a chord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pitch {
    Single(String),
    Chord(Vec<String>),
}

impl Pitch {
    pub fn names(&self) -> &[String] {
        match self {
            Pitch::Single(name) => std::slice::from_ref(name),
            Pitch::Chord(names) => names,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: Pitch,
    /// Beats from the start of the sample
    pub start: f64,
    /// Beats
    pub duration: f64,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
}

fn default_velocity() -> u8 {
    80
}

impl Note {
    pub fn new(pitch: &str, start: f64, duration: f64, velocity: u8) -> Self {
        Self {
            pitch: Pitch::Single(pitch.to_string()),
            start,
            duration,
            velocity,
        }
    }

    pub fn chord(pitches: &[&str], start: f64, duration: f64, velocity: u8) -> Self {
        Self {
            pitch: Pitch::Chord(pitches.iter().map(|p| p.to_string()).collect()),
            start,
            duration,
            velocity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub sound: SoundType,
    pub notes: Vec<Note>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default)]
    pub portamento: bool,
    #[serde(default = "default_portamento_time")]
    pub portamento_time: u8,
    #[serde(default)]
    pub patch: Option<Patch>,
}

fn default_volume() -> u8 {
    100
}

fn default_portamento_time() -> u8 {
    40
}

impl Layer {
    pub fn new(name: &str, sound: SoundType, notes: Vec<Note>) -> Self {
        Self {
            name: name.to_string(),
            sound,
            notes,
            muted: false,
            volume: default_volume(),
            portamento: false,
            portamento_time: default_portamento_time(),
            patch: None,
        }
    }
}

/// An immutable musical snapshot. Edits build a new `Sample`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub bpm: u32,
    pub bars: u32,
    #[serde(default = "default_time_signature")]
    pub time_signature: (u32, u32),
    pub layers: Vec<Layer>,
}

fn default_time_signature() -> (u32, u32) {
    (4, 4)
}

impl Sample {
    pub fn new(name: &str, bpm: u32, bars: u32, layers: Vec<Layer>) -> Result<Self> {
        let sample = Self {
            name: name.to_string(),
            bpm,
            bars,
            time_signature: default_time_signature(),
            layers,
        };
        sample.validate()?;
        Ok(sample)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        let sample: Sample =
            ron::from_str(&ron_string).map_err(|e| Error::InvalidSample(e.to_string()))?;
        sample.validate()?;
        Ok(sample)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidSample(msg));

        if !(MIN_BPM..=MAX_BPM).contains(&self.bpm) {
            return invalid(format!("bpm {} outside {MIN_BPM}..={MAX_BPM}", self.bpm));
        }
        if !(1..=MAX_BARS).contains(&self.bars) {
            return invalid(format!("bars {} outside 1..={MAX_BARS}", self.bars));
        }
        if self.time_signature.0 == 0 || self.time_signature.1 == 0 {
            return invalid("time signature parts must be non-zero".into());
        }

        let length = self.duration_beats();
        for layer in &self.layers {
            if layer.volume > 127 || layer.portamento_time > 127 {
                return invalid(format!("layer '{}' has a control value above 127", layer.name));
            }
            for note in &layer.notes {
                if !note.start.is_finite() || note.start < 0.0 {
                    return invalid(format!("note in '{}' starts before 0", layer.name));
                }
                if !note.duration.is_finite() || note.duration <= 0.0 {
                    return invalid(format!("note in '{}' has non-positive duration", layer.name));
                }
                if note.start + note.duration > length {
                    return invalid(format!(
                        "note in '{}' ends at beat {} past the sample's {length}",
                        layer.name,
                        note.start + note.duration
                    ));
                }
                if !(1..=127).contains(&note.velocity) {
                    return invalid(format!(
                        "note in '{}' has velocity {}",
                        layer.name, note.velocity
                    ));
                }
                if note.pitch.names().is_empty() {
                    return invalid(format!("note in '{}' has no pitch", layer.name));
                }
            }
        }

        Ok(())
    }

    pub fn beat_seconds(&self) -> f64 {
        60.0 / self.bpm as f64
    }

    pub fn duration_beats(&self) -> f64 {
        self.bars as f64 * self.time_signature.0 as f64
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_beats() * self.beat_seconds()
    }

    /// Returns a copy holding only layers whose sound is listed.
    pub fn with_layers(&self, sounds: &[SoundType]) -> Sample {
        Sample {
            layers: self
                .layers
                .iter()
                .filter(|l| sounds.contains(&l.sound))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}
