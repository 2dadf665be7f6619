//! MIDI output boundary.
//!
//! The playback engine talks to a [`MidiSink`]; the hardware implementation
//! wraps a midir output connection, [`MemorySink`] records bytes in memory.

use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::events::{MidiMessage, cc};

#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("Failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("Port not found: {requested} (available: {})", available.join(", "))]
    PortNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub trait MidiSink: Send + Sync {
    fn send_raw(&self, bytes: &[u8]) -> Result<(), MidiError>;

    fn send(&self, message: &MidiMessage) -> Result<(), MidiError> {
        self.send_raw(&message.to_bytes())
    }
}

/// The all-channels reset: every channel gets All-Sound-Off, All-Notes-Off,
/// Reset-All-Controllers and Sustain-Off.
pub fn panic_messages() -> Vec<MidiMessage> {
    (0..16u8)
        .flat_map(|channel| {
            [
                cc::ALL_SOUND_OFF,
                cc::ALL_NOTES_OFF,
                cc::RESET_ALL_CONTROLLERS,
                cc::SUSTAIN,
            ]
            .map(|controller| MidiMessage::ControlChange {
                channel,
                controller,
                value: 0,
            })
        })
        .collect()
}

/// Sends the reset sequence. Send failures are logged, never returned, so a
/// half-broken port still gets every message that can reach it.
pub fn send_panic(sink: &dyn MidiSink) {
    let mut failures = 0;
    for message in panic_messages() {
        if let Err(e) = sink.send(&message) {
            failures += 1;
            if failures == 1 {
                warn!("Panic send failed: {}", e);
            }
        }
    }
    if failures > 0 {
        warn!("Panic: {} of 64 messages failed", failures);
    }
}

pub fn list_ports() -> Result<Vec<String>, MidiError> {
    let midi_out = MidiOutput::new("juno-scan").map_err(|e| MidiError::InitFailed(e.to_string()))?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|p| midi_out.port_name(p).ok())
        .collect())
}

/// A connected hardware MIDI output.
pub struct MidiOutputPort {
    connection: Mutex<Option<MidiOutputConnection>>,
    pub port_name: String,
    messages_sent: AtomicU64,
}

impl MidiOutputPort {
    /// Opens the first output port whose name contains `port_pattern`.
    pub fn open(port_pattern: &str) -> Result<Self, MidiError> {
        let midi_out =
            MidiOutput::new("juno-out").map_err(|e| MidiError::InitFailed(e.to_string()))?;

        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n.contains(port_pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| MidiError::PortNotFound {
                requested: port_pattern.to_string(),
                available: ports
                    .iter()
                    .filter_map(|p| midi_out.port_name(p).ok())
                    .collect(),
            })?;

        let port_name = midi_out
            .port_name(port)
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        let connection = midi_out
            .connect(port, "juno-output")
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        info!("Opened MIDI output: {}", port_name);

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            port_name,
            messages_sent: AtomicU64::new(0),
        })
    }

    pub fn close(&self) {
        if let Some(conn) = self.connection.lock().take() {
            conn.close();
            info!(
                "Closed MIDI output: {} ({} messages sent)",
                self.port_name,
                self.messages_sent.load(Ordering::Relaxed)
            );
        }
    }
}

impl MidiSink for MidiOutputPort {
    fn send_raw(&self, bytes: &[u8]) -> Result<(), MidiError> {
        let mut guard = self.connection.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| MidiError::SendFailed("connection closed".into()))?;
        conn.send(bytes)
            .map_err(|e| MidiError::SendFailed(e.to_string()))?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for MidiOutputPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Records everything sent to it. Used for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl MidiSink for MemorySink {
    fn send_raw(&self, bytes: &[u8]) -> Result<(), MidiError> {
        self.sent.lock().push(bytes.to_vec());
        Ok(())
    }
}
