//! Dispatch table - routes each request envelope to the handler registered
//! for its (kind, version), and the responder loop that drives it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ProtocolError, Result};
use crate::protocol::chunked::ChunkWriter;
use crate::protocol::codec::{Envelope, Header};
use crate::protocol::message::{ErrorCode, ErrorMessage, Payload};
use crate::protocol::session::{FrameWriter, Session};

/// What a handler gets besides the decoded request.
pub struct RequestContext<'a> {
    header: Header,
    stream: &'a str,
    writer: &'a mut FrameWriter,
}

impl<'a> RequestContext<'a> {
    pub fn new(header: Header, stream: &'a str, writer: &'a mut FrameWriter) -> Self {
        Self {
            header,
            stream,
            writer,
        }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    /// Label of the stream the request arrived on.
    pub fn stream(&self) -> &str {
        self.stream
    }

    pub async fn send<M: Payload>(&mut self, message: &M) -> Result<()> {
        self.writer.send(message).await
    }

    pub fn chunk_writer(&mut self) -> ChunkWriter<'_> {
        ChunkWriter::new(self.writer)
    }
}

/// Handler for one payload type.
#[async_trait]
pub trait TypedHandler<M: Payload>: Send + Sync + 'static {
    async fn handle(&self, request: M, ctx: &mut RequestContext<'_>) -> Result<()>;
}

/// Type-erased table entry: decodes the payload, then calls the typed
/// handler.
#[async_trait]
pub trait Handler: Send + Sync {
    fn message_name(&self) -> &'static str;

    async fn call(&self, envelope: Envelope, ctx: &mut RequestContext<'_>) -> Result<()>;
}

struct Typed<M, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> Handler for Typed<M, H>
where
    M: Payload,
    H: TypedHandler<M>,
{
    fn message_name(&self) -> &'static str {
        M::KIND.name()
    }

    async fn call(&self, envelope: Envelope, ctx: &mut RequestContext<'_>) -> Result<()> {
        let request = M::decode(&envelope.payload)?;
        self.handler.handle(request, ctx).await
    }
}

// =============================================================================
// Builder / Table
// =============================================================================

#[derive(Default)]
pub struct DispatchBuilder {
    entries: HashMap<Header, Arc<dyn Handler>>,
    replaced: Vec<Header>,
}

impl DispatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `M`'s (kind, version). A later registration
    /// for the same pair replaces the earlier one.
    pub fn register<M, H>(mut self, handler: Arc<H>) -> Self
    where
        M: Payload,
        H: TypedHandler<M>,
    {
        let entry: Arc<dyn Handler> = Arc::new(Typed::<M, H> {
            handler,
            _marker: PhantomData,
        });
        if self.entries.insert(M::header(), entry).is_some() {
            self.replaced.push(M::header());
        }
        self
    }

    pub fn build(self) -> DispatchTable {
        for header in &self.replaced {
            tracing::warn!(%header, "handler registered twice, keeping the last one");
        }
        DispatchTable {
            entries: self.entries,
        }
    }
}

/// Immutable (kind, version) -> handler map, shared by every stream task.
pub struct DispatchTable {
    entries: HashMap<Header, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchBuilder {
        DispatchBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, kind: u32, version: u32) -> Result<Arc<dyn Handler>> {
        self.entries
            .get(&Header::new(kind, version))
            .cloned()
            .ok_or(ProtocolError::UnknownMessage { kind, version })
    }

    /// Run one request to completion.
    pub async fn dispatch(&self, envelope: Envelope, session: &mut Session) -> Result<()> {
        let header = envelope.header;
        let handler = self.lookup(header.kind, header.version)?;
        tracing::trace!(stream = %session.label, handler = handler.message_name(), "calling handler");
        let mut ctx = RequestContext::new(header, &session.label, &mut session.writer);
        handler.call(envelope, &mut ctx).await
    }

    /// Responder loop: read a request, dispatch it, repeat until the peer
    /// finishes the stream (Ok) or something fails (Err).
    ///
    /// On a failed request the peer gets a best-effort error envelope before
    /// the stream is given up. Frames that do not decode close the stream
    /// without a reply.
    pub async fn serve(&self, session: &mut Session) -> Result<()> {
        loop {
            let envelope = match session.reader.read_one().await {
                Ok(envelope) => envelope,
                Err(ProtocolError::EndOfStream) => {
                    tracing::debug!(stream = %session.label, "peer finished stream");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(stream = %session.label, error = %err, "failed to read request");
                    return Err(err);
                }
            };

            let header = envelope.header;
            tracing::debug!(stream = %session.label, %header, "dispatching request");

            if let Err(err) = self.dispatch(envelope, session).await {
                tracing::warn!(stream = %session.label, %header, error = %err, "request failed");
                let reply = ErrorMessage::new(ErrorCode::for_error(&err));
                if let Err(send_err) = session.writer.send(&reply).await {
                    tracing::debug!(stream = %session.label, error = %send_err, "could not send error reply");
                }
                return Err(err);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE;
    use crate::protocol::message::{ListPoolRequest, ListPoolResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Names(&'static [&'static str]);

    #[async_trait]
    impl TypedHandler<ListPoolRequest> for Names {
        async fn handle(&self, request: ListPoolRequest, ctx: &mut RequestContext<'_>) -> Result<()> {
            assert_eq!(ctx.header(), Header::of::<ListPoolRequest>());
            let names = self.0.iter().map(|n| format!("{}/{n}", request.pool)).collect();
            ctx.send(&ListPoolResponse { names }).await
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl TypedHandler<ListPoolRequest> for Counting {
        async fn handle(&self, _: ListPoolRequest, _: &mut RequestContext<'_>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom").into())
        }
    }

    fn session_pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Session::new(ar, aw, "client", DEFAULT_MAX_FRAME_SIZE),
            Session::new(br, bw, "server", DEFAULT_MAX_FRAME_SIZE),
        )
    }

    #[test]
    fn test_lookup_unknown() {
        let table = DispatchTable::builder()
            .register::<ListPoolRequest, _>(Arc::new(Names(&[])))
            .build();
        assert_eq!(table.len(), 1);
        assert!(table.lookup(2, 1).is_ok());
        assert!(matches!(
            table.lookup(2, 2),
            Err(ProtocolError::UnknownMessage {
                kind: 2,
                version: 2
            })
        ));
    }

    #[test]
    fn test_register_replaces() {
        let table = DispatchTable::builder()
            .register::<ListPoolRequest, _>(Arc::new(Names(&["x"])))
            .register::<ListPoolRequest, _>(Arc::new(Counting(AtomicUsize::new(0))))
            .build();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_serve_until_end_of_stream() {
        let table = Arc::new(
            DispatchTable::builder()
                .register::<ListPoolRequest, _>(Arc::new(Names(&["vol-a", "vol-b"])))
                .build(),
        );
        let (mut client, mut server) = session_pair();
        let responder = tokio::spawn(async move { table.serve(&mut server).await });

        for pool in ["nova", "glance"] {
            let resp: ListPoolResponse = client
                .request(&ListPoolRequest {
                    pool: pool.to_string(),
                })
                .await
                .unwrap();
            assert_eq!(resp.names, vec![format!("{pool}/vol-a"), format!("{pool}/vol-b")]);
        }

        client.close().await.unwrap();
        responder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_sends_error_reply() {
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let table = DispatchTable::builder()
            .register::<ListPoolRequest, _>(handler.clone())
            .build();
        let (mut client, mut server) = session_pair();

        client
            .writer()
            .send(&ListPoolRequest {
                pool: "nova".to_string(),
            })
            .await
            .unwrap();
        let err = table.serve(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Handler(_)));
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        assert!(matches!(
            client.reader().read::<ListPoolResponse>().await,
            Err(ProtocolError::Remote { code: 4 })
        ));
    }
}
