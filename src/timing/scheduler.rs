use super::{Layer, Sample, note_to_midi};
use crate::error::Result;
use crate::events::{MidiMessage, ScheduledEvent, cc};

/// Compiles a sample into a time-ordered list of device messages.
///
/// Muted layers are skipped. Each remaining layer gets its setup messages at
/// t=0 (volume, portamento switch and time, then bank/program if a patch is
/// bound), followed by a note-on/note-off pair per pitch. Events at the same
/// timestamp keep their input order. Any unparseable pitch fails the whole
/// compile.
pub fn compile(sample: &Sample) -> Result<Vec<ScheduledEvent>> {
    let beat_seconds = sample.beat_seconds();
    let mut events = Vec::new();

    for layer in sample.layers.iter().filter(|l| !l.muted) {
        let channel = layer.sound.channel();

        events.extend(setup_messages(layer).into_iter().map(|message| ScheduledEvent {
            time: 0.0,
            message,
        }));

        for note in &layer.notes {
            let start = note.start * beat_seconds;
            let end = (note.start + note.duration) * beat_seconds;

            for name in note.pitch.names() {
                let pitch = note_to_midi(name)?;
                events.push(ScheduledEvent {
                    time: start,
                    message: MidiMessage::NoteOn {
                        channel,
                        pitch,
                        velocity: note.velocity,
                    },
                });
                events.push(ScheduledEvent {
                    time: end,
                    message: MidiMessage::NoteOff { channel, pitch },
                });
            }
        }
    }

    // Vec::sort_by is stable, so ties keep layer/note order.
    events.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(events)
}

/// Messages that put a layer's channel into the state the layer asks for.
pub fn setup_messages(layer: &Layer) -> Vec<MidiMessage> {
    let channel = layer.sound.channel();
    let control = |controller, value| MidiMessage::ControlChange {
        channel,
        controller,
        value,
    };

    let mut messages = vec![
        control(cc::VOLUME, layer.volume),
        control(cc::PORTAMENTO, if layer.portamento { 127 } else { 0 }),
        control(cc::PORTAMENTO_TIME, layer.portamento_time),
    ];

    if let Some(patch) = &layer.patch {
        messages.extend(patch_messages(channel, patch));
    }

    messages
}

pub fn patch_messages(channel: u8, patch: &super::Patch) -> [MidiMessage; 3] {
    [
        MidiMessage::ControlChange {
            channel,
            controller: cc::BANK_SELECT_MSB,
            value: patch.bank_msb,
        },
        MidiMessage::ControlChange {
            channel,
            controller: cc::BANK_SELECT_LSB,
            value: patch.bank_lsb,
        },
        MidiMessage::ProgramChange {
            channel,
            program: patch.program,
        },
    ]
}
