//! Chunk framing across the capture process boundary.
//!
//! The worker writes frames to its stdout: a little-endian `u32` payload
//! length followed by the payload, one frame per PCM chunk.

use bytes::Bytes;
use std::io::{self, Read, Write};

/// Hard ceiling on a frame; anything larger means the stream is corrupt.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads the next frame. `Ok(None)` is a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[1, 2, 3, 4]).unwrap();
        write_frame(&mut buf, &[9; 8]).unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).unwrap().unwrap().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(read_frame(&mut reader).unwrap().unwrap().len(), 8);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0; 16]).unwrap();
        buf.truncate(10);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
