//! Envelope encoding and newline-terminated framing.
//!
//! Wire format of one frame:
//!
//! ```text
//! stuff(cbor {1: {1: kind, 2: version}, 2: bstr payload}) 0x0A
//! ```
//!
//! The body is byte-stuffed so the terminator never appears inside it:
//! `0x0A -> 0x7D 0x2A` and `0x7D -> 0x7D 0x5D`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use minicbor::{Decoder, Encoder};
use std::fmt;
use tokio_util::codec;

use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::message::{decode_bytes, decode_map_len, decode_u32, MessageKind, Payload};

/// Byte that ends every frame.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Escape byte used by the stuffing scheme.
pub const ESCAPE: u8 = 0x7D;

const ESCAPE_XOR: u8 = 0x20;

/// Default maximum stuffed frame body (64MB), matching the largest chunk a
/// storage backend is expected to hand out plus overhead.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Header / Envelope
// =============================================================================

/// Routing information of a message. `kind` stays a raw integer so unknown
/// kinds still decode and can be rejected by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub kind: u32,
    pub version: u32,
}

impl Header {
    pub fn new(kind: u32, version: u32) -> Self {
        Self { kind, version }
    }

    pub fn of<M: Payload>() -> Self {
        M::header()
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_u32(self.kind)
    }

    pub fn is<M: Payload>(&self) -> bool {
        *self == M::header()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}/v{}", kind.name(), self.version),
            None => write!(f, "kind-{}/v{}", self.kind, self.version),
        }
    }
}

/// A decoded message whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn is<M: Payload>(&self) -> bool {
        self.header.is::<M>()
    }

    /// Interpret the payload as `M`, failing if the header names another
    /// (kind, version).
    pub fn payload<M: Payload>(&self) -> Result<M> {
        if !self.is::<M>() {
            return Err(ProtocolError::PayloadMismatch {
                expected: M::KIND.name(),
                kind: self.header.kind,
                version: self.header.version,
            });
        }
        Ok(M::decode(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.header.kind, self.header.version, &self.payload)
    }
}

/// Encode an envelope from its parts.
pub fn encode(kind: u32, version: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(payload.len() + 16);
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.u32(1)?.map(2)?.u32(1)?.u32(kind)?.u32(2)?.u32(version)?;
    enc.u32(2)?.bytes(payload)?;
    Ok(buf)
}

/// Decode an envelope. Unknown top-level and header keys are skipped.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let mut header = None;
    let mut payload = None;

    for _ in 0..decode_map_len(&mut dec)? {
        match dec.u32()? {
            1 => header = Some(decode_header(&mut dec)?),
            2 => payload = Some(Bytes::copy_from_slice(decode_bytes(&mut dec)?)),
            _ => dec.skip()?,
        }
    }
    if dec.position() != bytes.len() {
        return Err(DecodeError::TrailingBytes);
    }

    Ok(Envelope {
        header: header.ok_or(DecodeError::MissingField("header"))?,
        payload: payload.ok_or(DecodeError::MissingField("payload"))?,
    })
}

fn decode_header(dec: &mut Decoder<'_>) -> Result<Header, DecodeError> {
    let mut kind = None;
    let mut version = None;
    for _ in 0..decode_map_len(dec)? {
        match dec.u32()? {
            1 => kind = Some(decode_u32(dec, "kind")?),
            2 => version = Some(decode_u32(dec, "version")?),
            _ => dec.skip()?,
        }
    }
    Ok(Header {
        kind: kind.ok_or(DecodeError::MissingField("kind"))?,
        version: version.ok_or(DecodeError::MissingField("version"))?,
    })
}

// =============================================================================
// Byte stuffing
// =============================================================================

/// Append `src` to `dst` with the terminator and escape bytes escaped.
pub fn stuff_into(src: &[u8], dst: &mut BytesMut) {
    dst.reserve(src.len() + src.len() / 64 + 1);
    for &b in src {
        if b == FRAME_TERMINATOR || b == ESCAPE {
            dst.put_u8(ESCAPE);
            dst.put_u8(b ^ ESCAPE_XOR);
        } else {
            dst.put_u8(b);
        }
    }
}

pub fn stuff(src: &[u8]) -> BytesMut {
    let mut dst = BytesMut::new();
    stuff_into(src, &mut dst);
    dst
}

/// Reverse [`stuff`]. A dangling escape or an escape of any byte other than
/// the two stuffed ones is rejected.
pub fn unstuff(src: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter().enumerate();
    while let Some((offset, &b)) = iter.next() {
        match b {
            ESCAPE => match iter.next() {
                Some((_, &e)) if e == FRAME_TERMINATOR ^ ESCAPE_XOR || e == ESCAPE ^ ESCAPE_XOR => {
                    out.push(e ^ ESCAPE_XOR)
                }
                _ => return Err(DecodeError::InvalidEscape(offset)),
            },
            FRAME_TERMINATOR => return Err(DecodeError::InvalidEscape(offset)),
            _ => out.push(b),
        }
    }
    Ok(out)
}

/// Encode an envelope as one complete frame, terminator included.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes> {
    let body = envelope.encode()?;
    let mut dst = stuff(&body);
    dst.put_u8(FRAME_TERMINATOR);
    Ok(dst.freeze())
}

/// Decode a frame body (terminator already removed).
pub fn decode_frame(body: &[u8]) -> Result<Envelope, DecodeError> {
    decode(&unstuff(body)?)
}

// =============================================================================
// FrameCodec
// =============================================================================

/// `tokio_util` codec for envelope frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    // Where to resume scanning for the terminator; everything before it has
    // already been checked.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            next_index: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let start = self.next_index.min(src.len());
        let Some(offset) = src[start..].iter().position(|b| *b == FRAME_TERMINATOR) else {
            if src.len() > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: src.len(),
                    max: self.max_frame_size,
                });
            }
            self.next_index = src.len();
            return Ok(None);
        };

        let end = start + offset;
        self.next_index = 0;
        if end > self.max_frame_size {
            src.advance(end + 1);
            return Err(ProtocolError::FrameTooLarge {
                size: end,
                max: self.max_frame_size,
            });
        }

        let frame = src.split_to(end + 1);
        Ok(Some(decode_frame(&frame[..end])?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame { pending: src.len() }),
        }
    }
}

impl codec::Encoder<Envelope> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = envelope.encode()?;
        let start = dst.len();
        stuff_into(&body, dst);
        let size = dst.len() - start;
        if size > self.max_frame_size {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
