/// A device message with its firing time, in seconds from the playback epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub time: f64,
    pub message: MidiMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Payload without the 0xF0/0xF7 framing bytes.
    SysEx(Vec<u8>),
}

pub mod cc {
    pub const BANK_SELECT_MSB: u8 = 0;
    pub const PORTAMENTO_TIME: u8 = 5;
    pub const VOLUME: u8 = 7;
    pub const BANK_SELECT_LSB: u8 = 32;
    pub const SUSTAIN: u8 = 64;
    pub const PORTAMENTO: u8 = 65;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const RESET_ALL_CONTROLLERS: u8 = 121;
    pub const ALL_NOTES_OFF: u8 = 123;
}

impl MidiMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::NoteOn {
                channel,
                pitch,
                velocity,
            } => vec![0x90 | (channel & 0x0F), pitch & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOff { channel, pitch } => vec![0x80 | (channel & 0x0F), pitch & 0x7F, 0],
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F],
            MidiMessage::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
            MidiMessage::SysEx(payload) => {
                let mut bytes = Vec::with_capacity(payload.len() + 2);
                bytes.push(0xF0);
                bytes.extend(payload.iter().map(|b| b & 0x7F));
                bytes.push(0xF7);
                bytes
            }
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self, MidiMessage::NoteOff { .. })
    }
}
