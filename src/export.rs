//! Standard MIDI File export.
//!
//! Format 1: a conductor track (name, tempo, time signature) followed by one
//! track per audible layer carrying its setup messages and notes.

use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::events::MidiMessage;
use crate::timing::{Layer, Sample, note_to_midi, setup_messages};

pub const TICKS_PER_BEAT: u16 = 480;

fn ticks(beats: f64) -> u32 {
    (beats * TICKS_PER_BEAT as f64).round().max(0.0) as u32
}

fn track_kind(message: &MidiMessage) -> Option<TrackEventKind<'static>> {
    use midly::MidiMessage as Wire;

    let (channel, message) = match *message {
        MidiMessage::NoteOn {
            channel,
            pitch,
            velocity,
        } => (
            channel,
            Wire::NoteOn {
                key: u7::from(pitch & 0x7F),
                vel: u7::from(velocity & 0x7F),
            },
        ),
        MidiMessage::NoteOff { channel, pitch } => (
            channel,
            Wire::NoteOff {
                key: u7::from(pitch & 0x7F),
                vel: u7::from(0),
            },
        ),
        MidiMessage::ControlChange {
            channel,
            controller,
            value,
        } => (
            channel,
            Wire::Controller {
                controller: u7::from(controller & 0x7F),
                value: u7::from(value & 0x7F),
            },
        ),
        MidiMessage::ProgramChange { channel, program } => (
            channel,
            Wire::ProgramChange {
                program: u7::from(program & 0x7F),
            },
        ),
        MidiMessage::SysEx(_) => return None,
    };
    Some(TrackEventKind::Midi {
        channel: u4::from(channel & 0x0F),
        message,
    })
}

/// Turns (tick, kind) pairs into delta-timed events ending in EndOfTrack.
/// Note-offs sort before anything else on the same tick.
fn finish_track(mut events: Vec<(u32, TrackEventKind<'_>)>) -> Vec<TrackEvent<'_>> {
    let is_off = |kind: &TrackEventKind| {
        matches!(
            kind,
            TrackEventKind::Midi {
                message: midly::MidiMessage::NoteOff { .. },
                ..
            }
        )
    };
    events.sort_by_key(|(tick, kind)| (*tick, !is_off(kind)));

    let mut last = 0;
    let mut track: Vec<TrackEvent> = events
        .into_iter()
        .map(|(tick, kind)| {
            let delta = tick - last;
            last = tick;
            TrackEvent {
                delta: u28::from(delta),
                kind,
            }
        })
        .collect();
    track.push(TrackEvent {
        delta: u28::from(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    track
}

fn conductor_track(sample: &Sample) -> Vec<TrackEvent<'_>> {
    let (numerator, denominator) = sample.time_signature;
    let tempo = 60_000_000 / sample.bpm.max(1);
    finish_track(vec![
        (0, TrackEventKind::Meta(MetaMessage::TrackName(sample.name.as_bytes()))),
        (0, TrackEventKind::Meta(MetaMessage::Tempo(u24::from(tempo)))),
        (
            0,
            TrackEventKind::Meta(MetaMessage::TimeSignature(
                numerator as u8,
                denominator.max(1).ilog2() as u8,
                24,
                8,
            )),
        ),
    ])
}

fn layer_track(layer: &Layer) -> Result<Vec<TrackEvent<'_>>> {
    let channel = layer.sound.channel();
    let mut events = vec![(0, TrackEventKind::Meta(MetaMessage::TrackName(layer.name.as_bytes())))];
    events.extend(
        setup_messages(layer)
            .iter()
            .filter_map(track_kind)
            .map(|kind| (0, kind)),
    );

    for note in &layer.notes {
        let on = ticks(note.start);
        let off = ticks(note.start + note.duration);
        for name in note.pitch.names() {
            let pitch = note_to_midi(name)?;
            let messages = [
                (on, MidiMessage::NoteOn {
                    channel,
                    pitch,
                    velocity: note.velocity,
                }),
                (off, MidiMessage::NoteOff { channel, pitch }),
            ];
            events.extend(
                messages
                    .iter()
                    .filter_map(|(tick, m)| track_kind(m).map(|kind| (*tick, kind))),
            );
        }
    }
    Ok(finish_track(events))
}

/// Encodes `sample` as SMF bytes.
pub fn to_smf(sample: &Sample) -> Result<Vec<u8>> {
    sample.validate()?;

    let mut tracks = vec![conductor_track(sample)];
    for layer in sample.layers.iter().filter(|l| !l.muted) {
        tracks.push(layer_track(layer)?);
    }

    let smf = Smf {
        header: Header::new(Format::Parallel, Timing::Metrical(u15::from(TICKS_PER_BEAT))),
        tracks,
    };
    let mut buffer = Vec::new();
    smf.write(&mut buffer)
        .map_err(|e| Error::Export(format!("failed to encode MIDI: {e}")))?;
    Ok(buffer)
}

pub fn save_smf(sample: &Sample, path: &Path) -> Result<()> {
    let bytes = to_smf(sample)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, &bytes)?;
    info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{Note, SoundType};

    fn sample() -> Sample {
        let bass = Layer::new(
            "bass",
            SoundType::Bass,
            vec![Note::new("C2", 0.0, 1.0, 100), Note::new("C2", 1.0, 1.0, 100)],
        );
        let pad = Layer::new(
            "pad",
            SoundType::Pad,
            vec![Note::chord(&["C4", "E4", "G4"], 0.0, 4.0, 70)],
        );
        let mut muted = Layer::new("lead", SoundType::Lead, vec![Note::new("C5", 0.0, 1.0, 90)]);
        muted.muted = true;
        Sample::new("export", 120, 1, vec![bass, pad, muted]).unwrap()
    }

    fn notes(track: &[TrackEvent]) -> Vec<(u32, bool, u8)> {
        let mut tick = 0;
        let mut out = Vec::new();
        for event in track {
            tick += event.delta.as_int();
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    midly::MidiMessage::NoteOn { key, .. } => out.push((tick, true, key.as_int())),
                    midly::MidiMessage::NoteOff { key, .. } => out.push((tick, false, key.as_int())),
                    _ => {}
                }
            }
        }
        out
    }

    #[test]
    fn test_tracks_per_audible_layer() {
        let bytes = to_smf(&sample()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::from(480)));
        // conductor + bass + pad; the muted lead is left out
        assert_eq!(smf.tracks.len(), 3);

        assert!(smf.tracks[0].iter().any(|e| matches!(
            e.kind,
            TrackEventKind::Meta(MetaMessage::Tempo(t)) if t.as_int() == 500_000
        )));
        assert!(matches!(
            smf.tracks[1][0].kind,
            TrackEventKind::Meta(MetaMessage::TrackName(b"bass"))
        ));
    }

    #[test]
    fn test_note_off_before_note_on_on_same_tick() {
        let bytes = to_smf(&sample()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(
            notes(&smf.tracks[1]),
            vec![(0, true, 36), (480, false, 36), (480, true, 36), (960, false, 36)]
        );
        let pad = notes(&smf.tracks[2]);
        assert_eq!(pad.len(), 6);
        assert!(pad.iter().filter(|(_, on, _)| !on).all(|(tick, _, _)| *tick == 1920));
    }

    #[test]
    fn test_layer_channels() {
        let bytes = to_smf(&sample()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let channels = |track: &[TrackEvent]| -> Vec<u8> {
            track
                .iter()
                .filter_map(|e| match e.kind {
                    TrackEventKind::Midi { channel, .. } => Some(channel.as_int()),
                    _ => None,
                })
                .collect()
        };
        assert!(channels(&smf.tracks[1]).iter().all(|c| *c == 0));
        assert!(channels(&smf.tracks[2]).iter().all(|c| *c == 1));
    }

    #[test]
    fn test_save_smf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("sample.mid");
        save_smf(&sample(), &path).unwrap();
        assert_eq!(&fs::read(&path).unwrap()[..4], b"MThd");
    }
}
