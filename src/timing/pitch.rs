use crate::error::{Error, Result};

const NAMES: [(&str, u8); 17] = [
    ("C", 0),
    ("C#", 1),
    ("Db", 1),
    ("D", 2),
    ("D#", 3),
    ("Eb", 3),
    ("E", 4),
    ("F", 5),
    ("F#", 6),
    ("Gb", 6),
    ("G", 7),
    ("G#", 8),
    ("Ab", 8),
    ("A", 9),
    ("A#", 10),
    ("Bb", 10),
    ("B", 11),
];

/// Converts a note name such as `C4`, `F#3` or `Bb-1` to its MIDI number.
///
/// `C4` is 60. Octaves run from -1 to 9; anything outside 0..=127 is rejected.
pub fn note_to_midi(name: &str) -> Result<u8> {
    let invalid = || Error::InvalidPitch(name.to_string());

    let split = name
        .find(|c: char| c == '-' || c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (class, octave) = name.split_at(split);

    let semitone = NAMES
        .iter()
        .find(|(n, _)| *n == class)
        .map(|(_, s)| *s)
        .ok_or_else(invalid)?;
    let octave: i32 = match octave.as_bytes() {
        b"-1" => -1,
        [digit @ b'0'..=b'9'] => (digit - b'0') as i32,
        _ => return Err(invalid()),
    };

    let number = (octave + 1) * 12 + semitone as i32;
    u8::try_from(number)
        .ok()
        .filter(|n| *n <= 127)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_pitches() {
        assert_eq!(note_to_midi("C4").unwrap(), 60);
        assert_eq!(note_to_midi("A4").unwrap(), 69);
        assert_eq!(note_to_midi("C-1").unwrap(), 0);
        assert_eq!(note_to_midi("G9").unwrap(), 127);
    }

    #[test]
    fn test_flats_match_sharps() {
        assert_eq!(note_to_midi("Db3").unwrap(), note_to_midi("C#3").unwrap());
        assert_eq!(note_to_midi("Bb2").unwrap(), 46);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(note_to_midi("G#9"), Err(Error::InvalidPitch(_))));
        assert!(matches!(note_to_midi("C10"), Err(Error::InvalidPitch(_))));
        assert!(matches!(note_to_midi("C-2"), Err(Error::InvalidPitch(_))));
    }

    #[test]
    fn test_malformed_rejected() {
        for name in ["", "H4", "C", "4", "c4", "C#x", "C04", "C004", "C-0", "C+4", "C4 "] {
            assert!(note_to_midi(name).is_err(), "{name} should be rejected");
        }
    }
}
