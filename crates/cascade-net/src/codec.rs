// cascade-net::codec — framing for stage-to-stage traffic.
//
// Wire format: [u32 big-endian length][bincode payload]
// Bincode keeps tensor data as length + raw elements; activations dominate
// the traffic and would grow by a third as base64 JSON.

use std::io::{Read, Write};

use cascade_types::StageFrame;

use crate::error::{NetError, Result};

/// Encode `frame` and write it as one length-prefixed message.
pub fn write_frame<W: Write>(io: &mut W, frame: &StageFrame, max_bytes: usize) -> Result<()> {
    let buf = bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))?;
    if buf.len() > max_bytes {
        return Err(NetError::FrameTooLarge {
            len: buf.len(),
            max: max_bytes,
        });
    }
    let len = u32::try_from(buf.len()).map_err(|_| NetError::FrameTooLarge {
        len: buf.len(),
        max: u32::MAX as usize,
    })?;
    io.write_all(&len.to_be_bytes())?;
    io.write_all(&buf)?;
    io.flush()?;
    Ok(())
}

/// Read one length-prefixed message and decode it.
pub fn read_frame<R: Read>(io: &mut R, max_bytes: usize) -> Result<StageFrame> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(NetError::FrameTooLarge { len, max: max_bytes });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)?;
    let (frame, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))?;
    Ok(frame)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
