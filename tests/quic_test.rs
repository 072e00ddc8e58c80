mod common;

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use snapback::exporter::ExportServer;
    use snapback::importer::{DirectoryArchive, Importer, ImporterSettings};
    use snapback::protocol::{
        read_chunks, Envelope, ErrorMessage, ExportRequest, Header, ListPoolRequest,
        ListPoolResponse, ListSnapshotsRequest, ListSnapshotsResponse, DEFAULT_MAX_FRAME_SIZE,
    };
    use snapback::transport::{client_config, PeerVerification, QuicConnector, StreamOpener, TransportSettings};
    use snapback::ProtocolError;

    use super::common::nova;

    struct Running {
        addr: String,
        fingerprint: String,
        cancel: CancellationToken,
        handle: JoinHandle<anyhow::Result<()>>,
    }

    fn start_exporter() -> anyhow::Result<Running> {
        let server = ExportServer::bind(
            "127.0.0.1:0".parse()?,
            Arc::new(nova()),
            &["localhost".to_string()],
            &TransportSettings::default(),
            DEFAULT_MAX_FRAME_SIZE,
        )?;
        let addr = server.local_addr()?.to_string();
        let fingerprint = server.fingerprint().to_string();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));
        Ok(Running {
            addr,
            fingerprint,
            cancel,
            handle,
        })
    }

    async fn connect(running: &Running, verification: PeerVerification) -> anyhow::Result<QuicConnector> {
        let config = client_config(verification, &TransportSettings::default())?;
        QuicConnector::connect(&running.addr, "localhost", config, DEFAULT_MAX_FRAME_SIZE).await
    }

    async fn stop(running: Running) -> anyhow::Result<()> {
        running.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), running.handle).await???;
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_streams_run_full_cycles() -> anyhow::Result<()> {
        let running = start_exporter()?;
        let connector = connect(&running, PeerVerification::Pinned(running.fingerprint.clone())).await?;

        let mut tasks = Vec::new();
        for (image, snapshot, expected) in [
            ("vol-a", "snap1", b"first diff\n".repeat(100)),
            ("vol-a", "snap2", b"second diff".to_vec()),
        ] {
            let mut session = connector.open_stream().await?;
            tasks.push(tokio::spawn(async move {
                let listing: ListPoolResponse = session
                    .request(&ListPoolRequest {
                        pool: "nova".to_string(),
                    })
                    .await?;
                assert!(listing.names.iter().any(|name| name == image));

                let snapshots: ListSnapshotsResponse = session
                    .request(&ListSnapshotsRequest {
                        pool: "nova".to_string(),
                        image: image.to_string(),
                    })
                    .await?;
                assert_eq!(snapshots.snapshots, vec!["snap1", "snap2"]);

                let request = ExportRequest {
                    pool: "nova".to_string(),
                    image: image.to_string(),
                    snapshot: snapshot.to_string(),
                };
                session.writer().send(&request).await?;
                let mut data = Vec::new();
                let response = read_chunks(session.reader(), |chunk| {
                    assert!(chunk.verify());
                    data.extend_from_slice(&chunk.payload);
                })
                .await?;
                assert!(response.answers(&request));
                assert_eq!(data, expected);
                session.close().await?;
                anyhow::Ok(())
            }));
        }
        for task in tasks {
            task.await??;
        }

        connector.close().await;
        stop(running).await
    }

    #[tokio::test]
    async fn test_unknown_message_ends_only_its_stream() -> anyhow::Result<()> {
        let running = start_exporter()?;
        let connector = connect(&running, PeerVerification::Pinned(running.fingerprint.clone())).await?;

        let mut broken = connector.open_stream().await?;
        let mut healthy = connector.open_stream().await?;

        broken
            .writer()
            .send_envelope(Envelope::new(Header::new(42, 1), Bytes::from_static(&[0xa0])))
            .await?;
        let reply: ErrorMessage = broken.reader().read().await?;
        assert_eq!(reply.error_code, 1);
        assert!(matches!(
            broken.reader().read_one().await,
            Err(ProtocolError::EndOfStream)
        ));

        let listing: ListPoolResponse = healthy
            .request(&ListPoolRequest {
                pool: "nova".to_string(),
            })
            .await?;
        assert_eq!(listing.names, vec!["vol-a", "vol-b"]);

        healthy.close().await?;
        connector.close().await;
        stop(running).await
    }

    #[tokio::test]
    async fn test_import_cycle_over_quic() -> anyhow::Result<()> {
        let running = start_exporter()?;
        let connector = connect(&running, PeerVerification::TrustOnConnect).await?;
        let dir = TempDir::new()?;
        let importer = Importer::new(
            ImporterSettings {
                export_full_when_no_snapshots: true,
                ..ImporterSettings::default()
            },
            Arc::new(DirectoryArchive::new(dir.path())),
        );

        let report = importer.run_cycle(&connector).await?;
        assert_eq!(report.images, 2);
        assert_eq!(report.snapshots, 3);
        assert_eq!(report.failures, 0);
        assert_eq!(
            std::fs::read(dir.path().join("nova/vol-a/snap2.diff"))?,
            b"second diff"
        );

        connector.close().await;
        stop(running).await
    }

    #[tokio::test]
    async fn test_pin_mismatch_refuses_exporter() -> anyhow::Result<()> {
        let running = start_exporter()?;
        let wrong = "00".repeat(32);
        assert_ne!(wrong, running.fingerprint);

        let result = connect(&running, PeerVerification::Pinned(wrong)).await;
        assert!(result.is_err());

        stop(running).await
    }
}
