//! Session reader/writer - one frame at a time over any byte stream.
//!
//! A stream gets exactly one [`FrameReader`] for its whole lifetime, so bytes
//! read past the end of one frame stay buffered for the next request.

use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{ProtocolError, Result};
use crate::protocol::codec::{Envelope, FrameCodec};
use crate::protocol::message::{ErrorMessage, MessageKind, Payload};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Reading half of a session.
pub struct FrameReader {
    inner: FramedRead<BoxedReader, FrameCodec>,
}

impl FrameReader {
    pub fn new<R>(reader: R, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let reader: BoxedReader = Box::pin(reader);
        Self {
            inner: FramedRead::new(reader, FrameCodec::with_max_frame_size(max_frame_size)),
        }
    }

    /// Read the next envelope. A clean close with nothing buffered is
    /// [`ProtocolError::EndOfStream`].
    pub async fn read_one(&mut self) -> Result<Envelope> {
        match self.inner.next().await {
            Some(result) => result,
            None => Err(ProtocolError::EndOfStream),
        }
    }

    /// Read the next envelope as `M`. An error envelope in place of `M` is
    /// reported as [`ProtocolError::Remote`].
    pub async fn read<M: Payload>(&mut self) -> Result<M> {
        let envelope = self.read_one().await?;
        if M::KIND != MessageKind::Error && envelope.is::<ErrorMessage>() {
            return Err(remote_error(&envelope));
        }
        envelope.payload::<M>()
    }
}

/// Convert an error envelope into [`ProtocolError::Remote`].
pub(crate) fn remote_error(envelope: &Envelope) -> ProtocolError {
    match envelope.payload::<ErrorMessage>() {
        Ok(msg) => ProtocolError::Remote {
            code: msg.error_code,
        },
        Err(err) => err,
    }
}

/// Writing half of a session. Every send is flushed before it returns.
pub struct FrameWriter {
    inner: FramedWrite<BoxedWriter, FrameCodec>,
}

impl FrameWriter {
    pub fn new<W>(writer: W, max_frame_size: usize) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            inner: FramedWrite::new(writer, FrameCodec::with_max_frame_size(max_frame_size)),
        }
    }

    pub async fn send<M: Payload>(&mut self, message: &M) -> Result<()> {
        self.send_envelope(message.to_envelope()?).await
    }

    pub async fn send_envelope(&mut self, envelope: Envelope) -> Result<()> {
        self.inner.send(envelope).await
    }

    /// Flush and finish the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// One bidirectional stream: a reader, a writer and a label for logs.
pub struct Session {
    pub(crate) reader: FrameReader,
    pub(crate) writer: FrameWriter,
    pub(crate) label: String,
}

impl Session {
    pub fn new<R, W>(reader: R, writer: W, label: impl Into<String>, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: FrameReader::new(reader, max_frame_size),
            writer: FrameWriter::new(writer, max_frame_size),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reader(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut FrameWriter {
        &mut self.writer
    }

    /// Send `request` and read exactly one `Resp` back.
    pub async fn request<Req, Resp>(&mut self, request: &Req) -> Result<Resp>
    where
        Req: Payload,
        Resp: Payload,
    {
        self.writer.send(request).await?;
        self.reader.read::<Resp>().await
    }

    /// Finish the write side; the peer sees end-of-stream.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}

// =============================================================================
// Tests
// =============================================================================
