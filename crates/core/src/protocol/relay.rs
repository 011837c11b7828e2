//! Relay framing for message-oriented byte streams.
//!
//! ```text
//! +-------------+----------------------+-----------------+
//! | 01 02 03 04 | length (u32, LE)     | payload         |
//! +-------------+----------------------+-----------------+
//! ```
//!
//! Used to carry SRT-style messages over TCP and to hand muxed packets to
//! an out-of-process relay.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, StreamError};

pub const MAGIC: [u8; 4] = [0x01, 0x02, 0x03, 0x04];
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted by the decoders.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame `payload` into a fresh buffer.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, payload.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
    out
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != MAGIC {
        return Err(StreamError::Relay("bad magic"));
    }
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len > MAX_PAYLOAD {
        return Err(StreamError::Relay("frame too large"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Incremental decoder for callers that receive arbitrary chunks.
#[derive(Debug, Default)]
pub struct RelayDecoder {
    buf: BytesMut,
}

impl RelayDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if buffered. A framing error leaves the buffer
    /// untouched; the stream cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buf[..4] != MAGIC {
            return Err(StreamError::Relay("bad magic"));
        }
        let len = LittleEndian::read_u32(&self.buf[4..8]) as usize;
        if len > MAX_PAYLOAD {
            return Err(StreamError::Relay("frame too large"));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}
