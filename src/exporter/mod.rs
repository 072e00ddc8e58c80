//! Exporter - the responder side.
//!
//! Owns storage access and serves list and export requests on every stream
//! an importer opens.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ExporterConfig, TransportConfig};
use crate::protocol::{
    DispatchTable, ErrorMessage, ExportRequest, ExportResponse, ListPoolRequest, ListPoolResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, RequestContext, Session, TypedHandler,
};
use crate::storage::{RbdBackend, StorageBackend};
use crate::transport::{server_endpoint, session_label, tls, TransportSettings};

// =============================================================================
// Request handlers
// =============================================================================

/// Request handlers backed by a storage backend.
pub struct Exporter {
    storage: Arc<dyn StorageBackend>,
}

impl Exporter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Dispatch table with every version 1 handler registered.
    pub fn dispatch_table(self: Arc<Self>) -> DispatchTable {
        DispatchTable::builder()
            .register::<ErrorMessage, _>(self.clone())
            .register::<ListPoolRequest, _>(self.clone())
            .register::<ListSnapshotsRequest, _>(self.clone())
            .register::<ExportRequest, _>(self)
            .build()
    }
}

/// An importer-side error report is not a request: nothing is answered and
/// the stream stays open, since the importer decides whether to keep using
/// it or to finish it.
#[async_trait]
impl TypedHandler<ErrorMessage> for Exporter {
    async fn handle(&self, request: ErrorMessage, _ctx: &mut RequestContext<'_>) -> crate::Result<()> {
        tracing::warn!(code = request.error_code, "importer reported an error");
        Ok(())
    }
}

#[async_trait]
impl TypedHandler<ListPoolRequest> for Exporter {
    async fn handle(&self, request: ListPoolRequest, ctx: &mut RequestContext<'_>) -> crate::Result<()> {
        let names = self.storage.list_images(&request.pool).await?;
        tracing::info!(pool = %request.pool, images = names.len(), "listed pool");
        ctx.send(&ListPoolResponse { names }).await
    }
}

#[async_trait]
impl TypedHandler<ListSnapshotsRequest> for Exporter {
    async fn handle(
        &self,
        request: ListSnapshotsRequest,
        ctx: &mut RequestContext<'_>,
    ) -> crate::Result<()> {
        let snapshots = self
            .storage
            .list_snapshots(&request.pool, &request.image)
            .await?;
        tracing::info!(
            pool = %request.pool,
            image = %request.image,
            snapshots = snapshots.len(),
            "listed snapshots"
        );
        ctx.send(&ListSnapshotsResponse {
            pool: request.pool,
            image: request.image,
            snapshots,
        })
        .await
    }
}

#[async_trait]
impl TypedHandler<ExportRequest> for Exporter {
    async fn handle(&self, request: ExportRequest, ctx: &mut RequestContext<'_>) -> crate::Result<()> {
        tracing::info!(
            pool = %request.pool,
            image = %request.image,
            snapshot = %request.snapshot,
            "export requested"
        );
        let data = self
            .storage
            .export(&request.pool, &request.image, request.snapshot())
            .await?;

        let stats = ctx.chunk_writer().pump(data).await?;
        tracing::info!(chunks = stats.chunks, bytes = stats.bytes, "export sent");

        ctx.send(&ExportResponse::from(request)).await
    }
}

// =============================================================================
// Server
// =============================================================================

/// QUIC listener serving one dispatch table.
pub struct ExportServer {
    endpoint: quinn::Endpoint,
    table: Arc<DispatchTable>,
    fingerprint: String,
    max_frame_size: usize,
}

impl ExportServer {
    /// Generate an ephemeral certificate and bind `listen`.
    pub fn bind(
        listen: SocketAddr,
        storage: Arc<dyn StorageBackend>,
        certificate_names: &[String],
        settings: &TransportSettings,
        max_frame_size: usize,
    ) -> Result<Self> {
        let credentials = tls::generate_self_signed(certificate_names)?;
        let fingerprint = credentials
            .fingerprint()
            .context("Generated certificate chain is empty")?;
        let endpoint = server_endpoint(listen, credentials, settings)?;
        let table = Arc::new(Arc::new(Exporter::new(storage)).dispatch_table());

        tracing::info!(
            address = %endpoint.local_addr()?,
            %fingerprint,
            "exporter listening"
        );

        Ok(Self {
            endpoint,
            table,
            fingerprint,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// SHA-256 fingerprint of the certificate this server presents.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Accept connections until `cancel` fires, then close the endpoint and
    /// wait for it to drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                tracing::info!("endpoint closed");
                break;
            };

            let table = self.table.clone();
            let cancel = cancel.clone();
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => serve_connection(connection, table, max_frame_size, cancel).await,
                    Err(err) => tracing::warn!(error = %err, "handshake failed"),
                }
            });
        }

        tracing::info!("exporter shutting down");
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

async fn serve_connection(
    connection: quinn::Connection,
    table: Arc<DispatchTable>,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    let span = tracing::info_span!(
        "connection",
        connection = connection.stable_id(),
        remote = %connection.remote_address()
    );

    async move {
        tracing::info!("connection accepted");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = connection.accept_bi() => accepted,
            };
            let (send, recv) = match accepted {
                Ok(streams) => streams,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => {
                    tracing::info!("connection closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connection lost");
                    break;
                }
            };

            let label = session_label(&connection, send.id());
            let span = tracing::info_span!("stream", stream = %label);
            let session = Session::new(recv, send, label, max_frame_size);
            tokio::spawn(serve_stream(session, table.clone()).instrument(span));
        }
    }
    .instrument(span)
    .await
}

async fn serve_stream(mut session: Session, table: Arc<DispatchTable>) {
    tracing::info!("stream opened");
    if table.serve(&mut session).await.is_err() {
        tracing::debug!("stream ended after a failed request");
    }
    if let Err(err) = session.close().await {
        tracing::debug!(error = %err, "failed to finish stream");
    }
    tracing::info!("stream closed");
}

/// Run an exporter backed by the `rbd` tool until `cancel` fires.
pub async fn run(
    config: &ExporterConfig,
    transport: &TransportConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let storage = RbdBackend::new(&config.rbd_binary)
        .with_args(config.rbd_args.clone())
        .with_chunk_size(config.chunk_size);

    let server = ExportServer::bind(
        config.listen,
        Arc::new(storage),
        &config.certificate_names,
        &transport.settings(),
        config.max_frame_size,
    )?;
    server.run(cancel).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::{read_chunks, ExportChunk, DEFAULT_MAX_FRAME_SIZE};
    use crate::storage::MemoryBackend;

    fn session_pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Session::new(ar, aw, "importer", DEFAULT_MAX_FRAME_SIZE),
            Session::new(br, bw, "exporter", DEFAULT_MAX_FRAME_SIZE),
        )
    }

    fn spawn_exporter(storage: MemoryBackend) -> (Session, tokio::task::JoinHandle<crate::Result<()>>) {
        let table = Arc::new(Exporter::new(Arc::new(storage))).dispatch_table();
        let (client, mut server) = session_pair();
        let handle = tokio::spawn(async move { table.serve(&mut server).await });
        (client, handle)
    }

    #[test]
    fn test_dispatch_table_registrations() {
        let table = Arc::new(Exporter::new(Arc::new(MemoryBackend::new()))).dispatch_table();
        assert_eq!(table.len(), 4);
        assert!(table.lookup(1, 1).is_ok());
        assert!(table.lookup(3, 1).is_err());
        assert!(table.lookup(8, 1).is_err());
    }

    #[tokio::test]
    async fn test_listing_requests() {
        let storage = MemoryBackend::new()
            .with_snapshot("nova", "vol-a", "snap1", b"diff".to_vec())
            .with_image("nova", "vol-b", Vec::new());
        let (mut client, handle) = spawn_exporter(storage);

        let pool: ListPoolResponse = client
            .request(&ListPoolRequest {
                pool: "nova".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(pool.names, vec!["vol-a", "vol-b"]);

        let snaps: ListSnapshotsResponse = client
            .request(&ListSnapshotsRequest {
                pool: "nova".to_string(),
                image: "vol-a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(snaps.pool, "nova");
        assert_eq!(snaps.image, "vol-a");
        assert_eq!(snaps.snapshots, vec!["snap1"]);

        client.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_export_request() {
        let diff = b"0123456789".repeat(10);
        let storage = MemoryBackend::new()
            .with_snapshot("nova", "vol-a", "snap1", diff.clone())
            .with_chunk_size(32);
        let (mut client, handle) = spawn_exporter(storage);

        let request = ExportRequest {
            pool: "nova".to_string(),
            image: "vol-a".to_string(),
            snapshot: "snap1".to_string(),
        };
        client.writer().send(&request).await.unwrap();

        let mut chunks: Vec<ExportChunk> = Vec::new();
        let response = read_chunks(client.reader(), |chunk| chunks.push(chunk))
            .await
            .unwrap();
        assert!(response.answers(&request));
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(ExportChunk::verify));
        let received: Vec<u8> = chunks.iter().flat_map(|c| c.payload.iter().copied()).collect();
        assert_eq!(received, diff);

        client.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_storage_failure_replies_error() {
        let (mut client, handle) = spawn_exporter(MemoryBackend::new().with_pool("nova"));

        let result: crate::Result<ListSnapshotsResponse> = client
            .request(&ListSnapshotsRequest {
                pool: "nova".to_string(),
                image: "missing".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ProtocolError::Remote { code: 3 })));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::Storage(_)));
    }

    #[tokio::test]
    async fn test_option_like_pool_is_refused() {
        let storage = RbdBackend::new("/nonexistent/rbd");
        let table = Arc::new(Exporter::new(Arc::new(storage))).dispatch_table();
        let (mut client, mut server) = session_pair();
        let handle = tokio::spawn(async move { table.serve(&mut server).await });

        let result: crate::Result<ListPoolResponse> = client
            .request(&ListPoolRequest {
                pool: "--log-file=/tmp/snapback".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ProtocolError::Remote { code: 3 })));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Storage(crate::storage::StorageError::InvalidName { what: "pool", .. })
        ));
    }

    #[tokio::test]
    async fn test_error_message_has_no_reply() {
        let storage = MemoryBackend::new().with_image("nova", "vol-a", Vec::new());
        let (mut client, handle) = spawn_exporter(storage);

        client
            .writer()
            .send(&ErrorMessage { error_code: 4 })
            .await
            .unwrap();
        let pool: ListPoolResponse = client
            .request(&ListPoolRequest {
                pool: "nova".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(pool.names, vec!["vol-a"]);

        client.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
