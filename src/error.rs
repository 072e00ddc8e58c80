//! Error types shared by the protocol layers.

use std::convert::Infallible;
use std::io;

use crate::storage::StorageError;

/// Malformed bytes on the wire.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,

    #[error("trailing bytes after message")]
    TrailingBytes,

    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
}

/// Everything that can go wrong while reading, writing, or serving messages
/// on a stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),

    #[error("expected {expected} message, got kind {kind} version {version}")]
    PayloadMismatch {
        expected: &'static str,
        kind: u32,
        version: u32,
    },

    #[error("no handler for message kind {kind} version {version}")]
    UnknownMessage { kind: u32, version: u32 },

    #[error("stream ended before the chunk sequence was terminated")]
    TruncatedTransfer,

    #[error("chunk sequence ended with kind {kind} version {version} instead of an export response")]
    UnexpectedTerminator { kind: u32, version: u32 },

    #[error("end of stream")]
    EndOfStream,

    #[error("stream closed with {pending} bytes of an unterminated frame")]
    TruncatedFrame { pending: usize },

    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("peer reported error code {code}")]
    Remote { code: u32 },

    #[error("transport: {0}")]
    Io(#[from] io::Error),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl ProtocolError {
    /// True when the stream's framing state can no longer be trusted, i.e.
    /// unread frames of an earlier exchange may still be in flight or the
    /// peer has stopped serving the stream.
    pub fn poisons_stream(&self) -> bool {
        !matches!(self, ProtocolError::Encode(_) | ProtocolError::Handler(_))
    }
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisons_stream() {
        assert!(ProtocolError::TruncatedTransfer.poisons_stream());
        assert!(ProtocolError::Remote { code: 3 }.poisons_stream());
        assert!(ProtocolError::EndOfStream.poisons_stream());
        assert!(!ProtocolError::Handler(anyhow::anyhow!("archive full")).poisons_stream());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::UnknownMessage {
            kind: 42,
            version: 1,
        };
        assert_eq!(err.to_string(), "no handler for message kind 42 version 1");

        let err = ProtocolError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds limit of 4 bytes");
    }
}
