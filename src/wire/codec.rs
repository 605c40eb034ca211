//! Frame envelope encoding.

use super::frame::Frame;
use crate::error::{LinkError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest payload accepted from the wire.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Encode a frame into a complete envelope.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(LinkError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(out)
}

/// Decode one complete envelope.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut cursor = bytes;
    read_frame(&mut cursor)?
        .ok_or_else(|| LinkError::Corruption("empty frame buffer".into()))
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let encoded = encode_frame(frame)?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the stream ends before a new frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(LinkError::Corruption(format!("frame length {} too large", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(LinkError::Corruption("frame checksum mismatch".into()));
    }

    Ok(Some(rmp_serde::from_slice(&payload)?))
}
