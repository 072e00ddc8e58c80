//! quinn endpoints for both sides.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::tls::{self, Credentials, PeerVerification};
use super::StreamOpener;
use crate::error::ProtocolError;
use crate::protocol::Session;

/// QUIC-level timers. There is no per-request timeout; a silent peer is
/// only detected through the idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub idle_timeout: Duration,
    pub keep_alive: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

fn transport_config(settings: &TransportSettings) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(settings.idle_timeout)
        .context("Idle timeout out of range")?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(settings.keep_alive);
    Ok(transport)
}

/// Bind an exporter endpoint on `listen`.
pub fn server_endpoint(
    listen: SocketAddr,
    credentials: Credentials,
    settings: &TransportSettings,
) -> Result<quinn::Endpoint> {
    let crypto = QuicServerConfig::try_from(tls::server_crypto(credentials)?)
        .context("TLS configuration unusable for QUIC")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(settings)?));

    quinn::Endpoint::server(config, listen)
        .with_context(|| format!("Failed to bind QUIC endpoint on {listen}"))
}

pub fn client_config(
    verification: PeerVerification,
    settings: &TransportSettings,
) -> Result<quinn::ClientConfig> {
    let crypto = QuicClientConfig::try_from(tls::client_crypto(verification)?)
        .context("TLS configuration unusable for QUIC")?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(settings)?));
    Ok(config)
}

/// Label used in logs for one stream of one connection.
pub fn session_label(connection: &quinn::Connection, stream: quinn::StreamId) -> String {
    format!("conn-{}/stream-{}", connection.stable_id(), stream.index())
}

fn transport_error<E>(err: E) -> ProtocolError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ProtocolError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, err))
}

/// Initiator side: one connection to an exporter, re-dialled if it is lost.
pub struct QuicConnector {
    endpoint: quinn::Endpoint,
    remote: SocketAddr,
    server_name: String,
    max_frame_size: usize,
    connection: Mutex<Option<quinn::Connection>>,
}

impl QuicConnector {
    /// Resolve `addr` and dial it. Failing to connect here is fatal to the
    /// caller.
    pub async fn connect(
        addr: &str,
        server_name: &str,
        config: quinn::ClientConfig,
        max_frame_size: usize,
    ) -> Result<Self> {
        let remote = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("Failed to resolve {addr}"))?
            .next()
            .with_context(|| format!("No addresses for {addr}"))?;

        let bind: SocketAddr = if remote.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint =
            quinn::Endpoint::client(bind).context("Failed to bind QUIC client endpoint")?;
        endpoint.set_default_client_config(config);

        let connector = Self {
            endpoint,
            remote,
            server_name: server_name.to_string(),
            max_frame_size,
            connection: Mutex::new(None),
        };
        let connection = connector
            .dial()
            .await
            .with_context(|| format!("Failed to connect to exporter at {addr}"))?;
        *connector.connection.lock().await = Some(connection);
        Ok(connector)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    async fn dial(&self) -> Result<quinn::Connection, ProtocolError> {
        let connection = self
            .endpoint
            .connect(self.remote, &self.server_name)
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;
        tracing::info!(
            remote = %self.remote,
            connection = connection.stable_id(),
            "connected to exporter"
        );
        Ok(connection)
    }

    /// Close the connection and wait for the peer to acknowledge.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close(0u32.into(), b"shutdown");
        }
        self.endpoint.wait_idle().await;
    }
}

#[async_trait]
impl StreamOpener for QuicConnector {
    async fn open_stream(&self) -> Result<Session, ProtocolError> {
        let connection = {
            let mut current = self.connection.lock().await;
            match current.as_ref() {
                Some(connection) if connection.close_reason().is_none() => connection.clone(),
                _ => {
                    tracing::warn!(remote = %self.remote, "connection lost, reconnecting");
                    let connection = self.dial().await?;
                    *current = Some(connection.clone());
                    connection
                }
            }
        };

        let (send, recv) = connection.open_bi().await.map_err(transport_error)?;
        let label = session_label(&connection, send.id());
        tracing::debug!(stream = %label, "opened stream");
        Ok(Session::new(recv, send, label, self.max_frame_size))
    }
}
