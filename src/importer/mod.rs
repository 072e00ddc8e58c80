//! Importer - the initiator side.
//!
//! Every cycle lists the configured pool, the snapshots of each image, and
//! pulls every snapshot diff into the archive. One failing image or
//! snapshot never ends the cycle; only the pool listing does.

pub mod archive;

pub use archive::{ArchiveError, ArchiveSink, ArchiveWriter, DirectoryArchive, DiscardArchive, ExportTarget};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{expand_tilde, ImporterConfig, TransportConfig};
use crate::error::ProtocolError;
use crate::protocol::{
    ChunkEvent, ChunkSequence, ExportRequest, ListPoolRequest, ListPoolResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, Session,
};
use crate::transport::{client_config, PeerVerification, QuicConnector, StreamOpener};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("checksum mismatch in chunk {index}: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { index: u64, expected: u32, actual: u32 },

    #[error("response for {got} does not answer request for {expected}")]
    Uncorrelated { expected: String, got: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl ImportError {
    /// True when the stream can no longer be used for the next request.
    pub fn poisons_stream(&self) -> bool {
        match self {
            ImportError::Protocol(err) => err.poisons_stream(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImporterSettings {
    pub pool: String,
    pub interval: Duration,
    pub export_full_when_no_snapshots: bool,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        Self {
            pool: "nova".to_string(),
            interval: Duration::from_secs(10),
            export_full_when_no_snapshots: false,
        }
    }
}

/// Totals of one import cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub images: usize,
    pub snapshots: usize,
    pub bytes: u64,
    pub failures: usize,
}

pub struct Importer {
    settings: ImporterSettings,
    archive: Arc<dyn ArchiveSink>,
}

impl Importer {
    pub fn new(settings: ImporterSettings, archive: Arc<dyn ArchiveSink>) -> Self {
        Self { settings, archive }
    }

    pub fn settings(&self) -> &ImporterSettings {
        &self.settings
    }

    /// Run cycles until `cancel` fires. A running cycle is abandoned on
    /// cancellation; uncommitted exports are discarded.
    pub async fn run(&self, opener: &dyn StreamOpener, cancel: CancellationToken) {
        tracing::info!(pool = %self.settings.pool, "starting import loop");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                // Failures are logged by run_cycle.
                _ = self.run_cycle(opener) => {}
            }

            tracing::info!(interval_secs = self.settings.interval.as_secs(), "waiting for next cycle");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        tracing::info!("stopping import loop");
    }

    /// Run one discovery-and-pull cycle on a fresh stream.
    pub async fn run_cycle(&self, opener: &dyn StreamOpener) -> Result<CycleReport, ProtocolError> {
        let started = Instant::now();
        let mut report = CycleReport::default();
        let result = self.cycle(opener, &mut report).await;

        match &result {
            Ok(()) => tracing::info!(
                images = report.images,
                snapshots = report.snapshots,
                bytes = report.bytes,
                failures = report.failures,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "import cycle finished"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                images = report.images,
                snapshots = report.snapshots,
                failures = report.failures,
                "import cycle aborted"
            ),
        }
        result.map(|()| report)
    }

    async fn cycle(&self, opener: &dyn StreamOpener, report: &mut CycleReport) -> Result<(), ProtocolError> {
        let pool = &self.settings.pool;
        let mut session = opener.open_stream().await?;
        tracing::info!(stream = %session.label(), %pool, "starting import");

        let images = session
            .request::<_, ListPoolResponse>(&ListPoolRequest { pool: pool.clone() })
            .await?
            .names;
        report.images = images.len();
        tracing::info!(%pool, images = ?images, "listed pool");

        for image in &images {
            let snapshots = match self.list_snapshots(&mut session, image).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(stream = %session.label(), %image, error = %err, "failed to list snapshots");
                    self.recover(&mut session, opener, &err).await?;
                    continue;
                }
            };

            let targets: Vec<Option<&str>> =
                if snapshots.is_empty() && self.settings.export_full_when_no_snapshots {
                    vec![None]
                } else {
                    snapshots.iter().map(|s| Some(s.as_str())).collect()
                };

            for snapshot in targets {
                match self.import(&mut session, image, snapshot).await {
                    Ok(bytes) => {
                        report.snapshots += 1;
                        report.bytes += bytes;
                    }
                    Err(err) => {
                        report.failures += 1;
                        tracing::warn!(
                            stream = %session.label(),
                            %image,
                            snapshot = snapshot.unwrap_or(""),
                            error = %err,
                            "export failed"
                        );
                        self.recover(&mut session, opener, &err).await?;
                    }
                }
            }
        }

        if let Err(err) = session.close().await {
            tracing::debug!(error = %err, "failed to finish stream");
        }
        Ok(())
    }

    async fn list_snapshots(&self, session: &mut Session, image: &str) -> Result<Vec<String>, ImportError> {
        let pool = &self.settings.pool;
        let response: ListSnapshotsResponse = session
            .request(&ListSnapshotsRequest {
                pool: pool.clone(),
                image: image.to_string(),
            })
            .await?;

        if response.pool != *pool || response.image != image {
            return Err(ImportError::Uncorrelated {
                expected: format!("{pool}/{image}"),
                got: format!("{}/{}", response.pool, response.image),
            });
        }
        tracing::info!(%image, snapshots = ?response.snapshots, "found snapshots");
        Ok(response.snapshots)
    }

    /// Replace a poisoned stream with a fresh one.
    async fn recover(
        &self,
        session: &mut Session,
        opener: &dyn StreamOpener,
        err: &ImportError,
    ) -> Result<(), ProtocolError> {
        if !err.poisons_stream() {
            return Ok(());
        }
        let fresh = opener.open_stream().await?;
        tracing::info!(old = %session.label(), new = %fresh.label(), "replaced poisoned stream");
        let poisoned = std::mem::replace(session, fresh);
        if let Err(err) = poisoned.close().await {
            tracing::debug!(error = %err, "failed to finish poisoned stream");
        }
        Ok(())
    }

    /// Pull one export into the archive. Returns the bytes archived.
    pub async fn import(
        &self,
        session: &mut Session,
        image: &str,
        snapshot: Option<&str>,
    ) -> Result<u64, ImportError> {
        let target = ExportTarget::new(&self.settings.pool, image, snapshot);
        let mut writer = self.archive.begin(&target).await?;

        let request = ExportRequest {
            pool: target.pool.clone(),
            image: target.image.clone(),
            snapshot: snapshot.unwrap_or_default().to_string(),
        };

        match receive(session, &request, writer.as_mut()).await {
            Ok(chunks) => {
                let bytes = writer.commit().await?;
                tracing::info!(%target, chunks, bytes, "export archived");
                Ok(bytes)
            }
            Err(err) => {
                writer.abort().await;
                Err(err)
            }
        }
    }
}

/// Send `request` and drain its whole chunk sequence into `writer`.
///
/// The sequence is always read to its terminator so the stream stays in
/// step, even after a bad chunk or a failed write. Returns the chunk count.
async fn receive(
    session: &mut Session,
    request: &ExportRequest,
    writer: &mut dyn ArchiveWriter,
) -> Result<u64, ImportError> {
    session.writer().send(request).await?;

    let mut sequence = ChunkSequence::new(session.reader());
    let mut chunks = 0u64;
    let mut failure: Option<ImportError> = None;

    loop {
        match sequence.next().await? {
            ChunkEvent::Chunk(chunk) => {
                let index = chunks;
                chunks += 1;
                if failure.is_some() {
                    continue;
                }
                let actual = chunk.computed_checksum();
                if actual != chunk.checksum {
                    failure = Some(ImportError::ChecksumMismatch {
                        index,
                        expected: chunk.checksum,
                        actual,
                    });
                    continue;
                }
                tracing::trace!(crc = chunk.checksum, len = chunk.payload.len(), "got export chunk");
                if let Err(err) = writer.write(&chunk.payload).await {
                    failure = Some(err.into());
                }
            }
            ChunkEvent::Done(response) => {
                if let Some(err) = failure {
                    return Err(err);
                }
                if !response.answers(request) {
                    return Err(ImportError::Uncorrelated {
                        expected: format!("{}/{}@{}", request.pool, request.image, request.snapshot),
                        got: format!("{}/{}@{}", response.pool, response.image, response.snapshot),
                    });
                }
                return Ok(chunks);
            }
        }
    }
}

/// Dial the configured exporter and import until `cancel` fires.
pub async fn run(
    config: &ImporterConfig,
    transport: &TransportConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let verification = PeerVerification::from_pin(config.pinned_fingerprint.as_deref());
    if verification == PeerVerification::TrustOnConnect {
        tracing::warn!("no pinned fingerprint configured, trusting any exporter certificate");
    }
    let client = client_config(verification, &transport.settings())?;
    let connector =
        QuicConnector::connect(&config.connect, &config.server_name, client, config.max_frame_size).await?;
    tracing::info!(remote = %connector.remote(), server_name = %config.server_name, "exporter reachable");

    let archive: Arc<dyn ArchiveSink> = match &config.archive_dir {
        Some(dir) => {
            let archive = DirectoryArchive::new(expand_tilde(dir));
            tracing::info!(path = %archive.root().display(), "archiving exports");
            Arc::new(archive)
        }
        None => {
            tracing::warn!("no archive directory configured, exports are discarded");
            Arc::new(DiscardArchive)
        }
    };

    let importer = Importer::new(config.settings(), archive);
    importer.run(&connector, cancel).await;
    connector.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_error_poisons_stream() {
        assert!(ImportError::Protocol(ProtocolError::TruncatedTransfer).poisons_stream());
        assert!(ImportError::Protocol(ProtocolError::Remote { code: 3 }).poisons_stream());
        assert!(!ImportError::ChecksumMismatch {
            index: 0,
            expected: 1,
            actual: 2
        }
        .poisons_stream());
        assert!(!ImportError::Uncorrelated {
            expected: "a".into(),
            got: "b".into()
        }
        .poisons_stream());
    }

    #[test]
    fn test_default_settings() {
        let settings = ImporterSettings::default();
        assert_eq!(settings.pool, "nova");
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert!(!settings.export_full_when_no_snapshots);
    }
}
