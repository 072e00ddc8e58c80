//! Message kinds and payload records.
//!
//! Every payload is a CBOR map keyed by small unsigned integers. Decoders
//! skip keys they do not know, so a later version may append fields without
//! breaking older readers. All payloads defined here are version 1.

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use std::convert::Infallible;

use crate::error::{DecodeError, ProtocolError};
use crate::protocol::codec::{Envelope, Header};

/// Version of every payload shape defined in this module.
pub const VERSION_1: u32 = 1;

/// Encoder handed to [`Payload::encode_fields`].
pub type CborEncoder<'a> = Encoder<&'a mut Vec<u8>>;

/// Encoder result for payload fields.
pub type EncodeResult = Result<(), minicbor::encode::Error<Infallible>>;

// =============================================================================
// Message Kinds
// =============================================================================

/// Semantic type of a message. Appended, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Error = 1,
    ListPoolRequest = 2,
    ListPoolResponse = 3,
    ListSnapshotsRequest = 4,
    ListSnapshotsResponse = 5,
    ExportRequest = 6,
    ExportResponse = 7,
    ExportChunk = 8,
}

impl MessageKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Error),
            2 => Some(Self::ListPoolRequest),
            3 => Some(Self::ListPoolResponse),
            4 => Some(Self::ListSnapshotsRequest),
            5 => Some(Self::ListSnapshotsResponse),
            6 => Some(Self::ExportRequest),
            7 => Some(Self::ExportResponse),
            8 => Some(Self::ExportChunk),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::ListPoolRequest => "list-pool-request",
            Self::ListPoolResponse => "list-pool-response",
            Self::ListSnapshotsRequest => "list-snapshots-request",
            Self::ListSnapshotsResponse => "list-snapshots-response",
            Self::ExportRequest => "export-request",
            Self::ExportResponse => "export-response",
            Self::ExportChunk => "export-chunk",
        }
    }
}

// =============================================================================
// Payload trait
// =============================================================================

/// A typed payload bound to exactly one (kind, version) pair.
pub trait Payload: Sized + Send + Sync + 'static {
    const KIND: MessageKind;
    const VERSION: u32;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult;

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    fn header() -> Header {
        Header::new(Self::KIND.as_u32(), Self::VERSION)
    }

    /// Encode the payload body (without envelope).
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        self.encode_fields(&mut Encoder::new(&mut buf))?;
        Ok(buf)
    }

    /// Decode a payload body. Trailing bytes are rejected.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let value = Self::decode_fields(&mut dec)?;
        if dec.position() != bytes.len() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }

    fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(Envelope::new(Self::header(), Bytes::from(self.encode()?)))
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    UnknownMessage = 1,
    MalformedRequest = 2,
    StorageFailure = 3,
    Internal = 4,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::UnknownMessage),
            2 => Some(Self::MalformedRequest),
            3 => Some(Self::StorageFailure),
            4 => Some(Self::Internal),
            _ => None,
        }
    }

    /// Code reported to the peer when serving a request fails with `err`.
    pub fn for_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownMessage { .. } => Self::UnknownMessage,
            ProtocolError::Decode(_) | ProtocolError::PayloadMismatch { .. } => {
                Self::MalformedRequest
            }
            ProtocolError::Storage(_) => Self::StorageFailure,
            _ => Self::Internal,
        }
    }
}

// =============================================================================
// ERROR (1)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error_code: u32,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            error_code: code as u32,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.error_code)
    }
}

impl Payload for ErrorMessage {
    const KIND: MessageKind = MessageKind::Error;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(1)?.u32(1)?.u32(self.error_code)?;
        Ok(())
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut error_code = None;
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                1 => error_code = Some(decode_u32(dec, "error-code")?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            error_code: error_code.ok_or(DecodeError::MissingField("error-code"))?,
        })
    }
}

// =============================================================================
// LIST_POOL_REQUEST (2) / LIST_POOL_RESPONSE (3)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPoolRequest {
    pub pool: String,
}

impl Payload for ListPoolRequest {
    const KIND: MessageKind = MessageKind::ListPoolRequest;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(1)?.u32(1)?.str(&self.pool)?;
        Ok(())
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut pool = None;
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                1 => pool = Some(decode_text(dec)?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            pool: pool.ok_or(DecodeError::MissingField("pool"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPoolResponse {
    pub names: Vec<String>,
}

impl Payload for ListPoolResponse {
    const KIND: MessageKind = MessageKind::ListPoolResponse;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(1)?.u32(1)?;
        encode_text_array(enc, &self.names)
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut names = None;
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                1 => names = Some(decode_text_array(dec)?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            names: names.ok_or(DecodeError::MissingField("names"))?,
        })
    }
}

// =============================================================================
// LIST_SNAPSHOTS_REQUEST (4) / LIST_SNAPSHOTS_RESPONSE (5)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSnapshotsRequest {
    pub pool: String,
    pub image: String,
}

impl Payload for ListSnapshotsRequest {
    const KIND: MessageKind = MessageKind::ListSnapshotsRequest;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(2)?;
        enc.u32(1)?.str(&self.pool)?;
        enc.u32(2)?.str(&self.image)?;
        Ok(())
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (mut pool, mut image) = (None, None);
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                1 => pool = Some(decode_text(dec)?),
                2 => image = Some(decode_text(dec)?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            pool: pool.ok_or(DecodeError::MissingField("pool"))?,
            image: image.ok_or(DecodeError::MissingField("image"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSnapshotsResponse {
    pub pool: String,
    pub image: String,
    pub snapshots: Vec<String>,
}

impl Payload for ListSnapshotsResponse {
    const KIND: MessageKind = MessageKind::ListSnapshotsResponse;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(3)?;
        enc.u32(1)?.str(&self.pool)?;
        enc.u32(2)?.str(&self.image)?;
        enc.u32(3)?;
        encode_text_array(enc, &self.snapshots)
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (mut pool, mut image, mut snapshots) = (None, None, None);
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                1 => pool = Some(decode_text(dec)?),
                2 => image = Some(decode_text(dec)?),
                3 => snapshots = Some(decode_text_array(dec)?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            pool: pool.ok_or(DecodeError::MissingField("pool"))?,
            image: image.ok_or(DecodeError::MissingField("image"))?,
            snapshots: snapshots.ok_or(DecodeError::MissingField("snapshots"))?,
        })
    }
}

// =============================================================================
// EXPORT_REQUEST (6) / EXPORT_RESPONSE (7)
// =============================================================================

/// Request to export `pool/image@snapshot`. An empty snapshot exports the
/// full image instead of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
}

impl ExportRequest {
    pub fn snapshot(&self) -> Option<&str> {
        (!self.snapshot.is_empty()).then_some(self.snapshot.as_str())
    }
}

impl Payload for ExportRequest {
    const KIND: MessageKind = MessageKind::ExportRequest;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        encode_export_target(enc, &self.pool, &self.image, &self.snapshot)
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (pool, image, snapshot) = decode_export_target(dec)?;
        Ok(Self {
            pool,
            image,
            snapshot,
        })
    }
}

/// Terminates the chunk sequence of an export and echoes the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResponse {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
}

impl ExportResponse {
    pub fn answers(&self, request: &ExportRequest) -> bool {
        self.pool == request.pool && self.image == request.image && self.snapshot == request.snapshot
    }
}

impl From<ExportRequest> for ExportResponse {
    fn from(request: ExportRequest) -> Self {
        Self {
            pool: request.pool,
            image: request.image,
            snapshot: request.snapshot,
        }
    }
}

impl Payload for ExportResponse {
    const KIND: MessageKind = MessageKind::ExportResponse;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        encode_export_target(enc, &self.pool, &self.image, &self.snapshot)
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (pool, image, snapshot) = decode_export_target(dec)?;
        Ok(Self {
            pool,
            image,
            snapshot,
        })
    }
}

fn encode_export_target(
    enc: &mut CborEncoder<'_>,
    pool: &str,
    image: &str,
    snapshot: &str,
) -> EncodeResult {
    enc.map(3)?;
    enc.u32(1)?.str(pool)?;
    enc.u32(2)?.str(image)?;
    enc.u32(3)?.str(snapshot)?;
    Ok(())
}

fn decode_export_target(dec: &mut Decoder<'_>) -> Result<(String, String, String), DecodeError> {
    let (mut pool, mut image, mut snapshot) = (None, None, None);
    for _ in 0..decode_map_len(dec)? {
        match dec.u32()? {
            1 => pool = Some(decode_text(dec)?),
            2 => image = Some(decode_text(dec)?),
            3 => snapshot = Some(decode_text(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok((
        pool.ok_or(DecodeError::MissingField("pool"))?,
        image.ok_or(DecodeError::MissingField("image"))?,
        snapshot.ok_or(DecodeError::MissingField("snapshot"))?,
    ))
}

// =============================================================================
// EXPORT_CHUNK (8)
// =============================================================================

/// One buffer of an export with the CRC-32C of exactly those bytes.
///
/// The checksum travels with the chunk but the protocol never rejects a
/// mismatch; use [`ExportChunk::verify`] on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportChunk {
    pub payload: Bytes,
    pub checksum: u32,
}

impl ExportChunk {
    /// Build a chunk, computing the checksum over `payload`.
    pub fn new(payload: Bytes) -> Self {
        let checksum = crc32c::crc32c(&payload);
        Self { payload, checksum }
    }

    pub fn computed_checksum(&self) -> u32 {
        crc32c::crc32c(&self.payload)
    }

    pub fn verify(&self) -> bool {
        self.computed_checksum() == self.checksum
    }
}

// Keys 2 and 3 are the chunk's historical field positions.
impl Payload for ExportChunk {
    const KIND: MessageKind = MessageKind::ExportChunk;
    const VERSION: u32 = VERSION_1;

    fn encode_fields(&self, enc: &mut CborEncoder<'_>) -> EncodeResult {
        enc.map(2)?;
        enc.u32(2)?.bytes(&self.payload)?;
        enc.u32(3)?.u32(self.checksum)?;
        Ok(())
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (mut payload, mut checksum) = (None, None);
        for _ in 0..decode_map_len(dec)? {
            match dec.u32()? {
                2 => payload = Some(Bytes::copy_from_slice(decode_bytes(dec)?)),
                3 => checksum = Some(decode_u32(dec, "checksum")?),
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            payload: payload.ok_or(DecodeError::MissingField("payload"))?,
            checksum: checksum.ok_or(DecodeError::MissingField("checksum"))?,
        })
    }
}

// =============================================================================
// CBOR helpers
// =============================================================================

pub(crate) fn decode_map_len(dec: &mut Decoder<'_>) -> Result<u64, DecodeError> {
    dec.map()?.ok_or(DecodeError::IndefiniteLength)
}

pub(crate) fn decode_u32(dec: &mut Decoder<'_>, field: &'static str) -> Result<u32, DecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| DecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

fn decode_text(dec: &mut Decoder<'_>) -> Result<String, DecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    Ok(dec.str()?.to_string())
}

pub(crate) fn decode_bytes<'b>(dec: &mut Decoder<'b>) -> Result<&'b [u8], DecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    Ok(dec.bytes()?)
}

fn encode_text_array(enc: &mut CborEncoder<'_>, items: &[String]) -> EncodeResult {
    enc.array(items.len() as u64)?;
    for item in items {
        enc.str(item)?;
    }
    Ok(())
}

fn decode_text_array(dec: &mut Decoder<'_>) -> Result<Vec<String>, DecodeError> {
    let len = dec.array()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        items.push(decode_text(dec)?);
    }
    Ok(items)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_from_u32() {
        assert_eq!(MessageKind::from_u32(1), Some(MessageKind::Error));
        assert_eq!(MessageKind::from_u32(6), Some(MessageKind::ExportRequest));
        assert_eq!(MessageKind::from_u32(8), Some(MessageKind::ExportChunk));
        assert_eq!(MessageKind::from_u32(0), None);
        assert_eq!(MessageKind::from_u32(9), None);
    }

    #[test]
    fn test_list_pool_roundtrip() {
        let req = ListPoolRequest {
            pool: "nova".to_string(),
        };
        assert_eq!(ListPoolRequest::decode(&req.encode().unwrap()).unwrap(), req);

        let empty = ListPoolResponse { names: vec![] };
        assert_eq!(ListPoolResponse::decode(&empty.encode().unwrap()).unwrap(), empty);

        let resp = ListPoolResponse {
            names: vec!["vol-a".to_string(), "vol-b".to_string()],
        };
        assert_eq!(ListPoolResponse::decode(&resp.encode().unwrap()).unwrap(), resp);
    }

    #[test]
    fn test_list_snapshots_roundtrip() {
        let resp = ListSnapshotsResponse {
            pool: "nova".to_string(),
            image: "vol-a".to_string(),
            snapshots: vec!["snap1".to_string(), "snap2".to_string()],
        };
        let decoded = ListSnapshotsResponse::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);

        let none = ListSnapshotsResponse {
            snapshots: vec![],
            ..resp
        };
        assert_eq!(ListSnapshotsResponse::decode(&none.encode().unwrap()).unwrap(), none);
    }

    #[test]
    fn test_export_request_full_image() {
        let req = ExportRequest {
            pool: "nova".to_string(),
            image: "vol-a".to_string(),
            snapshot: String::new(),
        };
        let decoded = ExportRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.snapshot(), None);

        let resp = ExportResponse::from(decoded.clone());
        assert!(resp.answers(&decoded));
    }

    #[test]
    fn test_export_chunk_checksum() {
        // CRC-32C check value from RFC 3720.
        let chunk = ExportChunk::new(Bytes::from_static(b"123456789"));
        assert_eq!(chunk.checksum, 0xE306_9283);
        assert!(chunk.verify());

        let decoded = ExportChunk::decode(&chunk.encode().unwrap()).unwrap();
        assert_eq!(decoded, chunk);

        let tampered = ExportChunk {
            payload: Bytes::from_static(b"123456780"),
            checksum: chunk.checksum,
        };
        assert!(!tampered.verify());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.u32(1).unwrap().str("nova").unwrap();
        enc.u32(7).unwrap().array(2).unwrap().u8(1).unwrap().u8(2).unwrap();
        enc.u32(2).unwrap().str("vol-a").unwrap();

        let decoded = ListSnapshotsRequest::decode(&buf).unwrap();
        assert_eq!(decoded.pool, "nova");
        assert_eq!(decoded.image, "vol-a");
    }

    #[test]
    fn test_missing_field() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .map(1)
            .unwrap()
            .u32(1)
            .unwrap()
            .str("nova")
            .unwrap();

        let err = ListSnapshotsRequest::decode(&buf).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("image")));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = ErrorMessage::new(ErrorCode::Internal).encode().unwrap();
        bytes.push(0x00);
        assert!(matches!(
            ErrorMessage::decode(&bytes),
            Err(DecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn test_error_code_for_error() {
        let unknown = ProtocolError::UnknownMessage {
            kind: 99,
            version: 1,
        };
        assert_eq!(ErrorCode::for_error(&unknown), ErrorCode::UnknownMessage);
        assert_eq!(
            ErrorCode::for_error(&ProtocolError::Decode(DecodeError::TrailingBytes)),
            ErrorCode::MalformedRequest
        );
        assert_eq!(
            ErrorCode::for_error(&ProtocolError::EndOfStream),
            ErrorCode::Internal
        );
    }
}
