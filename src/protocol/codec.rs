//! Protocol codec
//!
//! Encoding and decoding of envelopes on the wire.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬────────┬──────────┬──────────────┬─────────────┐
//! │ Len (4)  │  Id (4)  │ Op (1) │ NCtl (2) │  Controls    │   Payload   │
//! └──────────┴──────────┴────────┴──────────┴──────────────┴─────────────┘
//! ```
//! `Len` counts every byte after itself, so a reader can split the stream
//! into frames without looking past the current one.
//!
//! ### Control Format
//! ```text
//! ┌──────────┬───────┬──────────┬─────────┬─────────────┬─────────┐
//! │ OidLen(2)│  Oid  │ Crit (1) │ Has (1) │ [ValLen (4) │  Value] │
//! └──────────┴───────┴──────────┴─────────┴─────────────┴─────────┘
//! ```

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Control, Envelope, MessageId, OpCode};
use crate::error::{AtlasError, Result};

/// Length prefix size
pub const LEN_SIZE: usize = 4;

/// Fixed part of a frame body: id (4) + op (1) + control count (2)
pub const BODY_HEADER_SIZE: usize = 7;

/// Maximum frame body size (16 MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Outcome of decoding from a possibly partial buffer
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied
    Frame { envelope: Envelope, consumed: usize },

    /// The buffer holds only part of a frame
    NeedMoreBytes,
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode an envelope into a self-delimiting frame
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes> {
    let mut body_len = BODY_HEADER_SIZE + envelope.payload.len();
    for control in &envelope.controls {
        body_len += 2 + control.oid.len() + 2;
        if let Some(value) = &control.value {
            body_len += 4 + value.len();
        }
    }

    if body_len > MAX_FRAME_SIZE as usize {
        return Err(AtlasError::Serialization(format!(
            "Frame too large: {} bytes (max {})",
            body_len, MAX_FRAME_SIZE
        )));
    }
    if envelope.controls.len() > u16::MAX as usize {
        return Err(AtlasError::Serialization(format!(
            "Too many controls: {}",
            envelope.controls.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(LEN_SIZE + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u32(envelope.id.get());
    buf.put_u8(envelope.op as u8);
    buf.put_u16(envelope.controls.len() as u16);

    for control in &envelope.controls {
        if control.oid.len() > u16::MAX as usize {
            return Err(AtlasError::Serialization("Control OID too long".to_string()));
        }
        buf.put_u16(control.oid.len() as u16);
        buf.put_slice(control.oid.as_bytes());
        buf.put_u8(control.critical as u8);
        match &control.value {
            Some(value) => {
                buf.put_u8(1);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            None => buf.put_u8(0),
        }
    }

    buf.put_slice(&envelope.payload);
    Ok(buf.freeze())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one envelope from the front of `bytes`
///
/// Returns [`Decoded::NeedMoreBytes`] when the buffer ends mid-frame.
pub fn decode_envelope(bytes: &[u8]) -> Result<Decoded> {
    let Some(body_len) = peek_frame_len(bytes)? else {
        return Ok(Decoded::NeedMoreBytes);
    };

    let total_len = LEN_SIZE + body_len;
    if bytes.len() < total_len {
        return Ok(Decoded::NeedMoreBytes);
    }

    let body = Bytes::copy_from_slice(&bytes[LEN_SIZE..total_len]);
    let envelope = decode_body(body)?;
    Ok(Decoded::Frame {
        envelope,
        consumed: total_len,
    })
}

/// Read and validate the length prefix, if present
fn peek_frame_len(bytes: &[u8]) -> Result<Option<usize>> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    validate_body_len(body_len)?;
    Ok(Some(body_len as usize))
}

fn validate_body_len(body_len: u32) -> Result<()> {
    if body_len > MAX_FRAME_SIZE {
        return Err(AtlasError::ProtocolDecode(format!(
            "Frame too large: {} bytes (max {})",
            body_len, MAX_FRAME_SIZE
        )));
    }
    if (body_len as usize) < BODY_HEADER_SIZE {
        return Err(AtlasError::ProtocolDecode(format!(
            "Frame too short: {} bytes (min {})",
            body_len, BODY_HEADER_SIZE
        )));
    }
    Ok(())
}

/// Decode a frame body (everything after the length prefix)
fn decode_body(mut body: Bytes) -> Result<Envelope> {
    let id = MessageId(body.get_u32());
    let tag = body.get_u8();
    let op = OpCode::from_u8(tag).ok_or_else(|| {
        AtlasError::ProtocolDecode(format!("Unknown op-code: 0x{:02x}", tag))
    })?;

    let control_count = body.get_u16() as usize;
    let mut controls = Vec::with_capacity(control_count.min(16));
    for _ in 0..control_count {
        controls.push(decode_control(&mut body)?);
    }

    Ok(Envelope {
        id,
        op,
        payload: body,
        controls,
    })
}

fn decode_control(body: &mut Bytes) -> Result<Control> {
    ensure_remaining(body, 2, "control OID length")?;
    let oid_len = body.get_u16() as usize;
    ensure_remaining(body, oid_len + 2, "control OID")?;
    let oid = String::from_utf8(body.split_to(oid_len).to_vec())
        .map_err(|_| AtlasError::ProtocolDecode("Control OID is not UTF-8".to_string()))?;
    let critical = body.get_u8() != 0;

    let value = match body.get_u8() {
        0 => None,
        1 => {
            ensure_remaining(body, 4, "control value length")?;
            let value_len = body.get_u32() as usize;
            ensure_remaining(body, value_len, "control value")?;
            Some(body.split_to(value_len))
        }
        flag => {
            return Err(AtlasError::ProtocolDecode(format!(
                "Invalid control value flag: 0x{:02x}",
                flag
            )))
        }
    };

    Ok(Control {
        oid,
        critical,
        value,
    })
}

fn ensure_remaining(body: &Bytes, needed: usize, what: &str) -> Result<()> {
    if body.remaining() < needed {
        return Err(AtlasError::ProtocolDecode(format!(
            "Truncated {}: need {} bytes, have {}",
            what,
            needed,
            body.remaining()
        )));
    }
    Ok(())
}

// =============================================================================
// Incremental decoder
// =============================================================================

/// Splits an inbound byte stream into envelopes
///
/// Bytes are appended as they arrive; complete frames are cut off the
/// front of the buffer without copying their payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete envelope, if any
    ///
    /// An error means the stream is malformed and cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>> {
        let Some(body_len) = peek_frame_len(&self.buf)? else {
            return Ok(None);
        };
        if self.buf.len() < LEN_SIZE + body_len {
            return Ok(None);
        }

        self.buf.advance(LEN_SIZE);
        let body = self.buf.split_to(body_len).freeze();
        decode_body(body).map(Some)
    }

    /// Bytes held for a frame that has not fully arrived
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete envelope from a stream
///
/// Blocks until a complete frame is received or an error occurs
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Envelope> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf)?;

    let body_len = u32::from_be_bytes(len_buf);
    validate_body_len(body_len)?;

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body)?;

    decode_body(Bytes::from(body))
}

/// Write an envelope to a stream
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let bytes = encode_envelope(envelope)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
