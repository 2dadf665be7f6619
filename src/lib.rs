//! Drives a hardware synth over MIDI and streams its audio back out.
//!
//! [`PlaybackEngine`] fires compiled samples at the synth on a dedicated
//! thread. [`CaptureManager`] runs the audio input in a separate process and
//! fans its PCM chunks out to subscribers such as the websocket
//! [`StreamServer`] and the [`TrackAdapter`]. [`Studio`] ties the two together.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod midi;
pub mod stream;
pub mod studio;
pub mod timing;

pub use audio::{CaptureManager, Subscription, SubscriptionId, WorkerCommand};
pub use config::{AudioConfig, DeviceSelector, JunoConfig, StreamConfig};
pub use engine::{CompletionCallback, PlaybackEngine, PlaybackOutcome, PlaybackState};
pub use error::{Error, Result};
pub use events::{MidiMessage, ScheduledEvent};
pub use midi::{MemorySink, MidiError, MidiOutputPort, MidiSink};
pub use stream::{AudioFrame, StreamServer, Throttle, TrackAdapter};
pub use studio::Studio;
pub use timing::{Layer, Note, Patch, Pitch, Sample, SoundType, compile};
