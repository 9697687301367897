//! QUIC networking layer
//!
//! Handles endpoint creation and connection establishment for worker jobs.
//!
//! # Security
//!
//! Workers present a freshly generated self-signed certificate and clients
//! accept any certificate. QUIC requires TLS, but peers are not
//! authenticated; run workers on a trusted network only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use crate::channel::ChannelError;

/// Keepalive interval for idle job connections
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Idle timeout - longer than keepalive to allow connection recovery
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Certificate fingerprint - BLAKE3 hash of DER-encoded certificate
pub type CertFingerprint = [u8; 32];

/// Generate a self-signed certificate for a worker
pub fn generate_self_signed_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ChannelError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| ChannelError::Connect(format!("certificate generation failed: {}", e)))?;
    let key_der = cert.get_key_pair().serialize_der();
    let cert_der = cert
        .serialize_der()
        .map_err(|e| ChannelError::Connect(format!("certificate encoding failed: {}", e)))?;
    let key = PrivatePkcs8KeyDer::from(key_der).into();
    Ok((vec![CertificateDer::from(cert_der)], key))
}

/// Compute BLAKE3 fingerprint of a certificate
pub fn compute_cert_fingerprint(cert: &CertificateDer<'_>) -> CertFingerprint {
    *blake3::hash(cert.as_ref()).as_bytes()
}

/// Transport settings shared by workers and clients
pub fn create_transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();

    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    if let Ok(idle) = IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(idle));
    }

    // one job per connection: a bidi control stream plus at most one uni archive stream
    transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
    transport.max_concurrent_uni_streams(VarInt::from_u32(4));

    transport
}

/// Create a QUIC client endpoint on an ephemeral port.
///
/// The endpoint accepts any server certificate.
pub fn create_client_endpoint() -> Result<Endpoint, ChannelError> {
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], 0));
    let mut endpoint =
        Endpoint::client(bind_addr).map_err(|e| ChannelError::Connect(e.to_string()))?;

    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config()));

    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

/// Create a QUIC server endpoint
///
/// Returns the endpoint along with its certificate fingerprint for logging.
pub fn create_server_endpoint(
    bind_addr: SocketAddr,
) -> Result<(Endpoint, CertFingerprint), ChannelError> {
    let (certs, key) = generate_self_signed_cert()?;
    let fingerprint = compute_cert_fingerprint(&certs[0]);

    let crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let mut config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config()));

    let endpoint = Endpoint::server(config, bind_addr)
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

    info!("Worker endpoint created with cert fingerprint: {}", hex::encode(fingerprint));
    Ok((endpoint, fingerprint))
}

/// Connect to a worker
pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    server_name: &str,
) -> Result<Connection, ChannelError> {
    let connection = endpoint
        .connect(addr, server_name)
        .map_err(|e| ChannelError::Connect(e.to_string()))?
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

    debug!("Connected to {}", addr);
    Ok(connection)
}

/// Accepts any server certificate
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        debug!(
            "accepting worker certificate {}",
            hex::encode(compute_cert_fingerprint(end_entity))
        );
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_generation() {
        let (certs, _key) = generate_self_signed_cert().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(
            compute_cert_fingerprint(&certs[0]),
            compute_cert_fingerprint(&certs[0])
        );
    }
}
