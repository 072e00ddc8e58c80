//! QUIC transport: endpoints, TLS material and stream opening.

pub mod quic;
pub mod tls;

pub use quic::{client_config, server_endpoint, session_label, QuicConnector, TransportSettings};
pub use tls::{Credentials, PeerVerification, ALPN_PROTOCOL};

use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::protocol::Session;

/// Source of fresh bidirectional streams to an exporter.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self) -> Result<Session, ProtocolError>;
}
