//! Length-prefixed framing over a QUIC bidirectional stream, plus the
//! minimal TLS config builders both manager (accept side) and agent
//! (dial side) need. `quinn`'s streams are raw byte streams with no
//! message boundaries, so every frame is written as a `u32` length
//! prefix followed by the `bincode`-encoded payload.

use std::sync::Arc;

use quinn::{RecvStream, SendStream};

use crate::error::TunnelError;

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn write_frame(send: &mut SendStream, payload: &[u8]) -> Result<(), TunnelError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(TunnelError::EncodeError("frame too large".into()));
    }
    let len = payload.len() as u32;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    send.write_all(payload)
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    Ok(())
}

pub async fn read_frame(recv: &mut RecvStream) -> Result<Vec<u8>, TunnelError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::ProtocolError("frame too large".into()));
    }
    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    Ok(buf)
}

/// Returns whether `err` is an expected consequence of the peer closing
/// the stream or connection, rather than a genuine transport failure
/// (§8.13: "expected receive errors classify as a clean close, not a
/// fault").
pub fn is_expected_receive_error(err: &TunnelError) -> bool {
    match err {
        TunnelError::TransportError(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("closed")
                || msg.contains("reset")
                || msg.contains("eof")
                || msg.contains("connection lost")
        }
        _ => false,
    }
}

/// A self-signed development certificate and the `rustls` server config
/// built from it. Production deployments should supply their own
/// certificate material; this exists so the manager can stand up a QUIC
/// listener with zero external configuration, matching the teacher's
/// `rcgen`-based dev-cert bootstrap.
pub fn self_signed_server_config() -> Result<quinn::ServerConfig, TunnelError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    rustls_config.alpn_protocols = vec![b"arcane-edge-tunnel".to_vec()];

    let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(rustls_config)
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_config)))
}

/// An agent-side client config that accepts any certificate. Used for the
/// local development/self-hosted deployments this tunnel targets, where
/// the agent is paired with the manager out of band (via its token) and
/// does not rely on a public CA chain. See `DESIGN.md` for the
/// trust-on-first-use rationale.
pub fn insecure_client_config() -> Result<quinn::ClientConfig, TunnelError> {
    let rustls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(rustls_config)
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
