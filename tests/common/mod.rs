#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use snapback::exporter::Exporter;
use snapback::protocol::{DispatchTable, Session, DEFAULT_MAX_FRAME_SIZE};
use snapback::storage::MemoryBackend;
use snapback::transport::StreamOpener;
use snapback::ProtocolError;

/// Two in-process sessions wired to each other.
pub fn session_pair(label: &str) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (
        Session::new(ar, aw, format!("{label}-importer"), DEFAULT_MAX_FRAME_SIZE),
        Session::new(br, bw, format!("{label}-exporter"), DEFAULT_MAX_FRAME_SIZE),
    )
}

/// The pool layout used across tests:
/// `nova/vol-a` with `snap1` and `snap2`, `nova/vol-b` without snapshots.
pub fn nova() -> MemoryBackend {
    MemoryBackend::new()
        .with_image("nova", "vol-a", b"vol-a head".to_vec())
        .with_snapshot("nova", "vol-a", "snap1", b"first diff\n".repeat(100))
        .with_snapshot("nova", "vol-a", "snap2", b"second diff".to_vec())
        .with_image("nova", "vol-b", b"vol-b full image".to_vec())
        .with_chunk_size(256)
}

pub fn exporter_table(storage: MemoryBackend) -> Arc<DispatchTable> {
    Arc::new(Arc::new(Exporter::new(Arc::new(storage))).dispatch_table())
}

/// Opens in-process streams, each served by its own responder task.
pub struct DuplexOpener {
    table: Arc<DispatchTable>,
    opened: AtomicUsize,
}

impl DuplexOpener {
    pub fn new(table: Arc<DispatchTable>) -> Self {
        Self {
            table,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamOpener for DuplexOpener {
    async fn open_stream(&self) -> Result<Session, ProtocolError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let (importer, mut exporter) = session_pair(&format!("duplex-{n}"));
        let table = self.table.clone();
        tokio::spawn(async move {
            let _ = table.serve(&mut exporter).await;
            let _ = exporter.close().await;
        });
        Ok(importer)
    }
}

/// An opener whose exporter has gone away.
pub struct RefusingOpener;

#[async_trait]
impl StreamOpener for RefusingOpener {
    async fn open_stream(&self) -> Result<Session, ProtocolError> {
        Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "exporter unreachable",
        )))
    }
}
