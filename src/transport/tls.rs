//! TLS material for the QUIC endpoints.
//!
//! Provides:
//! - Ephemeral self-signed certificates for the exporter
//! - Server and client rustls configurations (TLS 1.3, ALPN `snapback`)
//! - Trust-on-connect verification with optional SHA-256 fingerprint pinning

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// ALPN protocol id negotiated by both sides.
pub const ALPN_PROTOCOL: &[u8] = b"snapback";

/// Certificate chain and private key of an exporter.
#[derive(Debug)]
pub struct Credentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Credentials {
    /// Fingerprint of the leaf certificate, or `None` for an empty chain.
    pub fn fingerprint(&self) -> Option<String> {
        self.cert_chain.first().map(fingerprint)
    }
}

/// Generate a self-signed certificate valid for `names`.
pub fn generate_self_signed(names: &[String]) -> Result<Credentials> {
    let certified = rcgen::generate_simple_self_signed(names.to_vec())
        .context("Failed to generate self-signed certificate")?;
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok(Credentials {
        cert_chain: vec![certified.cert.der().clone()],
        key: key.into(),
    })
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Accept `AA:BB:..` as well as plain hex, in either case.
pub fn normalize_fingerprint(pin: &str) -> String {
    pin.chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_crypto(credentials: Credentials) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 not supported by crypto provider")?
        .with_no_client_auth()
        .with_single_cert(credentials.cert_chain, credentials.key)
        .context("Failed to build TLS server configuration")?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// How the importer decides whether to trust an exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerVerification {
    /// Accept any certificate.
    TrustOnConnect,
    /// Accept only the certificate with this SHA-256 fingerprint.
    Pinned(String),
}

impl PeerVerification {
    pub fn from_pin(pin: Option<&str>) -> Self {
        match pin {
            Some(pin) if !pin.trim().is_empty() => Self::Pinned(normalize_fingerprint(pin)),
            _ => Self::TrustOnConnect,
        }
    }
}

pub fn client_crypto(verification: PeerVerification) -> Result<rustls::ClientConfig> {
    let provider = provider();
    let verifier = ExporterCertVerifier {
        verification,
        provider: provider.clone(),
    };
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 not supported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// Skips chain validation; exporters present ephemeral self-signed
/// certificates. Handshake signatures are still checked.
#[derive(Debug)]
struct ExporterCertVerifier {
    verification: PeerVerification,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ExporterCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let PeerVerification::Pinned(expected) = &self.verification {
            let actual = fingerprint(end_entity);
            if actual != *expected {
                tracing::warn!(%expected, %actual, "exporter certificate does not match pinned fingerprint");
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> Vec<String> {
        vec!["localhost".to_string()]
    }

    #[test]
    fn test_generate_self_signed() {
        let credentials = generate_self_signed(&localhost()).unwrap();
        assert_eq!(credentials.cert_chain.len(), 1);

        let fp = credentials.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // Every call produces a fresh key and certificate.
        let other = generate_self_signed(&localhost()).unwrap();
        assert_ne!(other.fingerprint(), credentials.fingerprint());
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("AB:cd:0F"), "abcd0f");
        assert_eq!(
            PeerVerification::from_pin(Some("AB:CD")),
            PeerVerification::Pinned("abcd".to_string())
        );
        assert_eq!(PeerVerification::from_pin(Some("  ")), PeerVerification::TrustOnConnect);
        assert_eq!(PeerVerification::from_pin(None), PeerVerification::TrustOnConnect);
    }

    #[test]
    fn test_crypto_configs() {
        let server = server_crypto(generate_self_signed(&localhost()).unwrap()).unwrap();
        assert_eq!(server.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);

        let client = client_crypto(PeerVerification::TrustOnConnect).unwrap();
        assert_eq!(client.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }

    #[test]
    fn test_pinned_verifier() {
        let credentials = generate_self_signed(&localhost()).unwrap();
        let cert = credentials.cert_chain[0].clone();
        let name = ServerName::try_from("localhost").unwrap();

        let verifier = ExporterCertVerifier {
            verification: PeerVerification::Pinned(fingerprint(&cert)),
            provider: provider(),
        };
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());

        let verifier = ExporterCertVerifier {
            verification: PeerVerification::Pinned("00".repeat(32)),
            provider: provider(),
        };
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_err());
    }
}
