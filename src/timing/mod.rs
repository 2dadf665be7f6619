mod pitch;
mod scheduler;
mod sequence;

pub use pitch::note_to_midi;
pub use scheduler::{compile, patch_messages, setup_messages};
pub use sequence::{Layer, MAX_BARS, MAX_BPM, MIN_BPM, Note, Patch, Pitch, Sample, SoundType};
