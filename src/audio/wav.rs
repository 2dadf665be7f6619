use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

use crate::error::{Error, Result};

/// Frames interleaved little-endian i16 PCM as a WAV file.
pub fn encode(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let frame_bytes = channels as usize * 2;
    if channels == 0 || pcm.len() % frame_bytes != 0 {
        return Err(Error::RecordFailed(format!(
            "{} bytes is not a whole number of {}-channel frames",
            pcm.len(),
            channels
        )));
    }

    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| Error::RecordFailed(format!("WAV encoding: {e}"));

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
        for bytes in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([bytes[0], bytes[1]]))
                .map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(cursor.into_inner())
}
