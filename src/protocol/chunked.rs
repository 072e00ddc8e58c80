//! Chunked transfer: an unbounded run of checksummed export chunks closed by
//! exactly one export response.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{ErrorMessage, ExportChunk, ExportResponse};
use crate::protocol::session::{remote_error, FrameReader, FrameWriter};
use crate::storage::StorageError;

/// Totals of one chunk run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub chunks: u64,
    pub bytes: u64,
}

// =============================================================================
// Producer
// =============================================================================

/// Sends export chunks on a stream. The caller sends the terminating
/// [`ExportResponse`] once the data is exhausted.
pub struct ChunkWriter<'a> {
    writer: &'a mut FrameWriter,
    stats: ChunkStats,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(writer: &'a mut FrameWriter) -> Self {
        Self {
            writer,
            stats: ChunkStats::default(),
        }
    }

    /// Send one chunk carrying exactly `buffer`.
    pub async fn write_chunk(&mut self, buffer: Bytes) -> Result<()> {
        let chunk = ExportChunk::new(buffer);
        tracing::trace!(crc = chunk.checksum, len = chunk.payload.len(), "sending chunk");
        self.writer.send(&chunk).await?;
        self.stats.chunks += 1;
        self.stats.bytes += chunk.payload.len() as u64;
        Ok(())
    }

    /// Send every non-empty buffer of `stream` as its own chunk.
    pub async fn pump<S>(&mut self, mut stream: S) -> Result<ChunkStats>
    where
        S: Stream<Item = std::result::Result<Bytes, StorageError>> + Unpin,
    {
        while let Some(buffer) = stream.next().await {
            let buffer = buffer?;
            if buffer.is_empty() {
                continue;
            }
            self.write_chunk(buffer).await?;
        }
        Ok(self.stats)
    }

    pub fn stats(&self) -> ChunkStats {
        self.stats
    }
}

// =============================================================================
// Consumer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Chunk(ExportChunk),
    Done(ExportResponse),
}

/// Pull-style reader of one chunk sequence.
pub struct ChunkSequence<'a> {
    reader: &'a mut FrameReader,
}

impl<'a> ChunkSequence<'a> {
    pub fn new(reader: &'a mut FrameReader) -> Self {
        Self { reader }
    }

    /// Next chunk, or the terminating response. Must not be called again
    /// after [`ChunkEvent::Done`].
    pub async fn next(&mut self) -> Result<ChunkEvent> {
        let envelope = match self.reader.read_one().await {
            Ok(envelope) => envelope,
            Err(ProtocolError::EndOfStream) => return Err(ProtocolError::TruncatedTransfer),
            Err(ProtocolError::TruncatedFrame { pending }) => {
                tracing::debug!(pending, "stream closed inside a frame");
                return Err(ProtocolError::TruncatedTransfer);
            }
            Err(err) => return Err(err),
        };

        if envelope.is::<ExportChunk>() {
            let chunk = envelope.payload::<ExportChunk>()?;
            tracing::trace!(crc = chunk.checksum, len = chunk.payload.len(), "received chunk");
            Ok(ChunkEvent::Chunk(chunk))
        } else if envelope.is::<ExportResponse>() {
            Ok(ChunkEvent::Done(envelope.payload()?))
        } else if envelope.is::<ErrorMessage>() {
            Err(remote_error(&envelope))
        } else {
            Err(ProtocolError::UnexpectedTerminator {
                kind: envelope.header.kind,
                version: envelope.header.version,
            })
        }
    }
}

/// Drain one chunk sequence, handing every chunk to `on_chunk`, and return
/// the terminating response.
pub async fn read_chunks<F>(reader: &mut FrameReader, mut on_chunk: F) -> Result<ExportResponse>
where
    F: FnMut(ExportChunk),
{
    let mut sequence = ChunkSequence::new(reader);
    loop {
        match sequence.next().await? {
            ChunkEvent::Chunk(chunk) => on_chunk(chunk),
            ChunkEvent::Done(response) => return Ok(response),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
