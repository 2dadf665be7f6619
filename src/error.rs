use crate::midi::MidiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected to a MIDI output")]
    NotConnected,

    #[error("Device not found: {requested} (available: {})", available.join(", "))]
    DeviceNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("Invalid pitch: {0}")]
    InvalidPitch(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Capture process failed to start: {0}")]
    ProcessStartFailure(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Recording failed: {0}")]
    RecordFailed(String),

    #[error(transparent)]
    Midi(#[from] MidiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Export failed: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, Error>;
